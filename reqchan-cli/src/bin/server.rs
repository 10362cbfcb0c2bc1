fn main() {
    reqchan_cli::init_tracing();
    if let Err(e) = reqchan_cli::run_server() {
        tracing::error!("reqchan-server failed: {e:#}");
        std::process::exit(1);
    }
}
