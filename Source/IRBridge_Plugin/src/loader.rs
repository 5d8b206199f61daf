//! Background reconfiguration thread.
//!
//! The host can change the impulse response path from the UI/automation
//! thread at any time; the actual file load and kernel init are slow, so
//! they run here. The adapter's own bypass discipline keeps the audio
//! thread glitch-free while a load is in flight.

use crossbeam_channel::{unbounded, Receiver, Sender};
use irbridge_core::ConvolutionEngineAdapter;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crate::logger::InstanceLogger;

#[derive(Debug)]
pub enum LoaderCommand {
    LoadImpulse(PathBuf),
}

#[derive(Debug)]
pub enum LoaderResponse {
    Loading(String),
    Loaded(String),
    Error(String),
}

#[derive(Clone)]
pub struct Loader {
    pub tx: Sender<LoaderCommand>,
    pub rx: Receiver<LoaderResponse>,
}

/// Coalesce queued requests: only the newest path matters, intermediate
/// ones would be torn down again immediately.
#[inline]
fn drain_to_latest_command(
    cmd_rx: &Receiver<LoaderCommand>,
    mut current: LoaderCommand,
) -> (LoaderCommand, usize) {
    let mut dropped = 0usize;
    while let Ok(next) = cmd_rx.try_recv() {
        current = next;
        dropped += 1;
    }
    (current, dropped)
}

impl Loader {
    pub fn new(adapter: Arc<ConvolutionEngineAdapter>, logger: Arc<InstanceLogger>) -> Self {
        let (cmd_tx, cmd_rx) = unbounded::<LoaderCommand>();
        let (resp_tx, resp_rx) = unbounded::<LoaderResponse>();

        thread::spawn(move || loop {
            let initial_cmd = match cmd_rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => break, // Channel disconnected
            };

            let (cmd, dropped) = drain_to_latest_command(&cmd_rx, initial_cmd);
            if dropped > 0 {
                logger.warn(
                    "Loader",
                    &format!(
                        "Coalesced {} queued load requests (keeping latest).",
                        dropped
                    ),
                );
            }

            match cmd {
                LoaderCommand::LoadImpulse(path) => {
                    let display = path.to_string_lossy().to_string();
                    logger.info("Loader", &format!("Loading impulse response: {}", display));
                    let _ = resp_tx.send(LoaderResponse::Loading(display.clone()));

                    match adapter.reconfigure(&path) {
                        Ok(()) => {
                            logger.info("Loader", &format!("Engine ready: {}", display));
                            let _ = resp_tx.send(LoaderResponse::Loaded(display));
                        }
                        Err(e) => {
                            // Adapter is back in bypass; audio keeps flowing
                            // as pass-through while the user picks another file.
                            logger.error("Loader", &format!("Load failed: {}", e));
                            let _ = resp_tx.send(LoaderResponse::Error(e.to_string()));
                        }
                    }
                }
            }
        });

        Self {
            tx: cmd_tx,
            rx: resp_rx,
        }
    }
}
