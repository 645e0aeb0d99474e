use beamlit_gateway::{Config, start_server};
use envconfig::Envconfig;

fn main() {
    let cpus = num_cpus::get();
    let worker_threads = std::cmp::max(1, cpus);
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .unwrap()
        .block_on(async { start().await });
}

async fn start() {
    match Config::init_from_env() {
        Ok(conf) => {
            if let Err(e) = start_server(conf).await {
                eprintln!("error starting gateway: {e:?}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("failed to load config from env: {e:?}");
            std::process::exit(1);
        }
    }
}
