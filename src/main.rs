fn main() {
    if let Err(error) = business_metrics_engine_lib::run() {
        eprintln!("{}", error);
        std::process::exit(1);
    }
}
