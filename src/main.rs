//! Process entry point; the pipeline itself lives in the library crate so
//! `benches/` can exercise its modules directly.

use log::error;

fn main() {
    env_logger::init();
    if let Err(e) = ddos_shield::run() {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}
