#![deny(unsafe_code)]

use iqrfd_api::bus::{ApiRequest, BusMessage, MessagingInstance};
use iqrfd_api::{Error, Result};
use std::convert::Infallible;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

mod config;
mod dispatch;
mod dpa;
mod enumerate;
mod exclusive;
mod js;
mod sensordata;
mod store;
mod testing;

// Initializes the application: determines the configuration and sets
// up the logger. Returns `None` if the program should exit (a
// command line option asked for a "usage" message, for instance).

async fn init_app() -> Option<config::Config> {
    if let Some(cfg) = config::get().await {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(cfg.get_log_level())
            .with_target(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("Unable to set global default subscriber");
        Some(cfg)
    } else {
        None
    }
}

async fn wrap_task(
    handle: JoinHandle<Result<Infallible>>,
) -> Result<Infallible> {
    match handle.await {
        Err(e) if e.is_panic() => {
            error!("terminated due to panic");
            Err(Error::OperationError("task panicked".to_owned()))
        }

        Err(_) => {
            error!("terminated due to cancellation");
            Err(Error::OperationError("task was canceled".to_owned()))
        }

        Ok(Ok(_)) => unreachable!(),

        Ok(Err(e)) => {
            error!("task returned error -- {}", &e);
            Err(e)
        }
    }
}

// A JSON-lines console standing in for the messaging splitter: one
// request document per stdin line, response and async documents on
// stdout. The real transports attach here in a full deployment.

async fn console(
    api_tx: mpsc::Sender<ApiRequest>,
    mut bus_rx: mpsc::Receiver<BusMessage>,
) -> Result<Infallible> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let messaging = MessagingInstance::new("console", "stdout");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        match serde_json::from_str(&line) {
                            Ok(doc) => {
                                api_tx
                                    .send(ApiRequest::new(
                                        messaging.clone(),
                                        doc,
                                    ))
                                    .await?;
                            }
                            Err(e) => warn!("unparsable request: {}", e),
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => {
                        return Err(Error::MissingPeer(
                            "stdin closed".to_owned(),
                        ))
                    }
                }
            }
            Some(msg) = bus_rx.recv() => {
                println!("{}", msg.doc);
            }
        }
    }
}

// Runs the main body of the daemon: opens the store, wires the
// components, and monitors their tasks.

async fn run() -> Result<()> {
    if let Some(cfg) = init_app().await {
        info!("opening store at {}", &cfg.store.path);

        let store: store::SharedStore = Arc::new(Mutex::new(store::Store::open(
            Path::new(&cfg.store.path),
            Path::new(&cfg.store.migrations),
        )?));

        // The physical transport, the scripting engine, and the
        // repository cache bind here. This build wires the simulated
        // coordinator so the daemon runs stand-alone; a deployment
        // substitutes the real collaborator libraries.

        let transport = Arc::new(testing::SimCoordinator::new());
        let engine = Arc::new(testing::StubRender::new());
        let cache = Arc::new(testing::StubCache::new());

        let (async_tx, async_rx) = mpsc::channel(32);

        transport.set_async_sender(async_tx);

        let dpa = exclusive::DpaService::new(transport);
        let wrapper = match tokio::fs::read_to_string(&cfg.js.wrapper_path)
            .await
        {
            Ok(wrapper) => wrapper,
            Err(_) => {
                warn!(
                    "wrapper source '{}' not found; contexts load bare",
                    &cfg.js.wrapper_path
                );
                String::new()
            }
        };
        let registry = js::ContextRegistry::new(engine, wrapper);

        let (bus_tx, bus_rx) = mpsc::channel(64);
        let (api_tx, api_rx) = mpsc::channel(16);

        info!("starting enumerator");

        let enumerator = Arc::new(enumerate::Enumerator::new(
            dpa.clone(),
            store.clone(),
            cache,
            registry.clone(),
            bus_tx.clone(),
            cfg.enumerator.clone(),
        ));
        let (enum_handle, _enum_task) = enumerator.start();

        info!("starting sensor data worker");

        let sensor_data = Arc::new(sensordata::SensorData::new(
            dpa.clone(),
            store.clone(),
            registry.clone(),
            bus_tx.clone(),
            cfg.sensor_data.clone(),
            cfg.path.clone(),
        ));

        if cfg.sensor_data.auto_run {
            sensor_data.start_worker();
        }

        info!("starting dispatcher");

        let dispatcher = Arc::new(
            dispatch::Dispatcher::new(
                dpa.clone(),
                registry,
                store,
                bus_tx,
            )
            .with_metadata_to_messages(cfg.enumerator.metadata_to_messages)
            .with_async_dpa_message(cfg.raw_api.async_dpa_message)
            .with_enumerator(enum_handle.clone())
            .with_sensor_data(sensor_data.clone()),
        );

        let tasks = vec![
            wrap_task(tokio::spawn(
                dispatcher
                    .run(api_rx, async_rx)
                    .instrument(info_span!("dispatch")),
            )),
            wrap_task(tokio::spawn(
                console(api_tx, bus_rx).instrument(info_span!("console")),
            )),
        ];

        let _ = futures::future::join_all(tasks).await;

        warn!("shutting down");
        enum_handle.stop();
        sensor_data.stop_worker();
        dpa.abort_all();
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ERROR: {e:?}")
    }
}
