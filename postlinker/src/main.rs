fn main() {
    if let Err(error) = run() {
        libpostlinker::error::report_error_and_exit(&error);
    }
}

fn run() -> libpostlinker::error::Result {
    let args = libpostlinker::Args::from_env()?;
    libpostlinker::run(&args)
}
