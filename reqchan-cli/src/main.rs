fn main() {
    reqchan_cli::init_tracing();
    if let Err(e) = reqchan_cli::run_client() {
        tracing::error!("reqchan failed: {e:#}");
        std::process::exit(1);
    }
}
