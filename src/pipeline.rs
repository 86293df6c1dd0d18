use crate::aggregator::refresh_core_user_metrics;
use crate::compiler::{compile_user_metrics, drop_orphaned_metric_tables};
use crate::db::Database;
use crate::errors::AppResult;
use crate::executor::{execute_layer, ExecutionOptions};
use crate::models::{Layer, ModelResult, PipelineRunResult, PipelineState, TenantId};
use crate::warehouse::{TenantSession, Warehouse};
use chrono::Utc;
use std::time::Instant;
use uuid::Uuid;

impl PipelineState {
    /// Transition after the current stage finished. `stage_ok` only matters for
    /// the layer stages; compilation and the aggregator refresh never fail a run.
    pub fn next(self, stage_ok: bool) -> PipelineState {
        match self {
            Self::Idle => Self::CompilingUserMetrics,
            Self::CompilingUserMetrics => Self::RunningStg,
            Self::RunningStg if stage_ok => Self::RunningInt,
            Self::RunningInt if stage_ok => Self::RefreshingCoreAggregator,
            Self::RefreshingCoreAggregator => Self::RunningCore,
            Self::RunningCore if stage_ok => Self::Succeeded,
            Self::RunningStg | Self::RunningInt | Self::RunningCore => Self::Failed,
            Self::Succeeded => Self::Succeeded,
            Self::Failed => Self::Failed,
        }
    }

    pub fn layer(self) -> Option<Layer> {
        match self {
            Self::RunningStg => Some(Layer::Staging),
            Self::RunningInt => Some(Layer::Intermediate),
            Self::RunningCore => Some(Layer::Core),
            _ => None,
        }
    }
}

/// Runs the full refresh of one tenant: compile user metrics, then STG, INT,
/// aggregator refresh and CORE. Stops at the first layer with a failed model.
///
/// Model failures are reported in the result; `Err` means the registry or the
/// warehouse itself was unavailable.
pub fn run_pipeline(
    db: &Database,
    warehouse: &Warehouse,
    tenant_id: TenantId,
    options: &ExecutionOptions,
) -> AppResult<PipelineRunResult> {
    let run_id = Uuid::new_v4().to_string();
    let started = Instant::now();
    db.insert_pipeline_run(&run_id, tenant_id, Utc::now())?;
    tracing::info!(run_id = %run_id, tenant_id = %tenant_id, "pipeline run started");

    let mut results = Vec::new();
    let outcome = warehouse
        .open_session(tenant_id)
        .and_then(|session| drive(db, &session, options, &run_id, &mut results));

    let final_state = match &outcome {
        Ok(state) => *state,
        Err(_) => PipelineState::Failed,
    };
    let result = PipelineRunResult {
        run_id: run_id.clone(),
        tenant_id,
        success: final_state == PipelineState::Succeeded,
        final_state,
        results,
        total_time_ms: started.elapsed().as_millis() as u64,
    };

    if let Err(error) = db.complete_pipeline_run(&result) {
        tracing::warn!(run_id = %run_id, error = %error, "failed to record pipeline run");
    }

    match outcome {
        Ok(_) => {
            tracing::info!(
                run_id = %run_id,
                tenant_id = %tenant_id,
                final_state = final_state.as_str(),
                models = result.results.len(),
                elapsed_ms = result.total_time_ms,
                "pipeline run finished"
            );
            Ok(result)
        }
        Err(error) => {
            tracing::error!(run_id = %run_id, tenant_id = %tenant_id, error = %error, "pipeline run aborted");
            Err(error)
        }
    }
}

fn drive(
    db: &Database,
    session: &TenantSession,
    options: &ExecutionOptions,
    run_id: &str,
    results: &mut Vec<ModelResult>,
) -> AppResult<PipelineState> {
    let tenant_id = session.tenant_id();
    let mut state = PipelineState::Idle;

    while !state.is_terminal() {
        let stage_ok = match state {
            PipelineState::CompilingUserMetrics => {
                match compile_user_metrics(db, tenant_id) {
                    Ok(compiled) => results.extend(compiled),
                    Err(error) => {
                        tracing::warn!(run_id, tenant_id = %tenant_id, error = %error, "user metric compilation skipped");
                    }
                }
                if let Err(error) = drop_orphaned_metric_tables(db, session) {
                    tracing::warn!(run_id, tenant_id = %tenant_id, error = %error, "orphaned metric cleanup failed");
                }
                true
            }
            PipelineState::RefreshingCoreAggregator => {
                if let Err(error) = refresh_core_user_metrics(db, tenant_id) {
                    tracing::warn!(run_id, tenant_id = %tenant_id, error = %error, "core aggregator refresh failed");
                }
                true
            }
            current => match current.layer() {
                Some(layer) => {
                    let layer_results = execute_layer(db, session, layer, options)?;
                    let failed = layer_results.iter().filter(|result| !result.success).count();
                    results.extend(layer_results);
                    if failed > 0 {
                        tracing::warn!(run_id, tenant_id = %tenant_id, layer = layer.as_str(), failed, "layer failed, halting pipeline");
                    }
                    failed == 0
                }
                None => true,
            },
        };
        state = state.next(stage_ok);
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use crate::models::{Layer, PipelineState};

    #[test]
    fn happy_path_visits_every_stage_in_order() {
        let mut state = PipelineState::Idle;
        let mut visited = vec![state];
        while !state.is_terminal() {
            state = state.next(true);
            visited.push(state);
        }
        assert_eq!(
            visited,
            vec![
                PipelineState::Idle,
                PipelineState::CompilingUserMetrics,
                PipelineState::RunningStg,
                PipelineState::RunningInt,
                PipelineState::RefreshingCoreAggregator,
                PipelineState::RunningCore,
                PipelineState::Succeeded,
            ]
        );
    }

    #[test]
    fn layer_failures_are_fatal_but_compilation_and_refresh_are_not() {
        assert_eq!(PipelineState::CompilingUserMetrics.next(false), PipelineState::RunningStg);
        assert_eq!(PipelineState::RefreshingCoreAggregator.next(false), PipelineState::RunningCore);
        assert_eq!(PipelineState::RunningStg.next(false), PipelineState::Failed);
        assert_eq!(PipelineState::RunningInt.next(false), PipelineState::Failed);
        assert_eq!(PipelineState::RunningCore.next(false), PipelineState::Failed);
        assert_eq!(PipelineState::Failed.next(true), PipelineState::Failed);
    }

    #[test]
    fn only_layer_stages_map_to_layers() {
        assert_eq!(PipelineState::RunningInt.layer(), Some(Layer::Intermediate));
        assert_eq!(PipelineState::RefreshingCoreAggregator.layer(), None);
    }
}
