//! Plugin lifecycle supervision.
//!
//! The supervisor runs the discover, serve, register cycle and keeps it
//! alive across kubelet restarts. It reacts to three inputs: creation of the
//! kubelet socket (the kubelet came back and forgot all plugins), SIGHUP
//! (operator requested restart) and the termination signals. A failed cycle
//! is retried with exponential backoff; a kubelet or operator event during
//! the backoff wait triggers an immediate attempt instead.

use std::cmp;
use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use notify::Event;
use notify::EventKind;
use rand::Rng;
use tokio::signal::unix::signal;
use tokio::signal::unix::Signal;
use tokio::signal::unix::SignalKind;
use tokio::time;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::server::PluginConfig;
use crate::server::RdmaDevicePlugin;
use crate::watcher::FsWatcher;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const RETRY_JITTER_PERCENT: f64 = 0.15;

/// Exponential backoff between serve attempts.
struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Jittered delay for the next attempt; doubles up to the cap.
    fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = cmp::min(self.next * 2, self.max);
        duration_with_jitter(base, RETRY_JITTER_PERCENT)
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Create a duration with jitter to avoid thundering herd problems
fn duration_with_jitter(base_duration: Duration, jitter_percent: f64) -> Duration {
    let mut rng = rand::rng();
    let jitter_range = base_duration.as_secs_f64() * jitter_percent;

    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let final_duration = base_duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(final_duration)
}

/// True for the filesystem event that marks a kubelet restart.
fn is_kubelet_restart(event: &Event, kubelet_socket: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_))
        && event.paths.iter().any(|path| path == kubelet_socket)
}

/// Keeps one [`RdmaDevicePlugin`] session serving, rebuilding it whenever
/// the kubelet restarts or an operator asks for it.
pub struct Supervisor {
    config: PluginConfig,
    watcher: FsWatcher,
    sighup: Signal,
    sigint: Signal,
    sigterm: Signal,
    sigquit: Signal,
    plugin: Option<RdmaDevicePlugin>,
    backoff: Backoff,
}

impl Supervisor {
    /// Sets up the filesystem watch on the plugin directory and the signal
    /// handlers. Failing to watch the directory is fatal; without it a
    /// kubelet restart would silently orphan the plugin.
    pub fn new(config: PluginConfig) -> anyhow::Result<Self> {
        let watcher = FsWatcher::new(&config.plugin_dir).with_context(|| {
            format!("watch plugin directory {}", config.plugin_dir.display())
        })?;
        let sighup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
        let sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
        let sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        let sigquit = signal(SignalKind::quit()).context("install SIGQUIT handler")?;
        Ok(Self {
            config,
            watcher,
            sighup,
            sigint,
            sigterm,
            sigquit,
            plugin: None,
            backoff: Backoff::new(INITIAL_RETRY_DELAY, MAX_RETRY_DELAY),
        })
    }

    /// Runs until a termination signal arrives, then stops the active
    /// session and returns.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let kubelet_socket = self.config.kubelet_socket();
        info!(
            "watching {} for kubelet restarts",
            self.config.plugin_dir.display()
        );

        let mut needs_start = true;
        // A failed attempt parks the loop until this deadline; unrelated
        // filesystem events must not shortcut it.
        let mut retry_at: Option<time::Instant> = None;
        loop {
            if needs_start && retry_at.is_none() {
                self.teardown().await;
                match self.try_serve().await {
                    Ok(()) => {
                        needs_start = false;
                        self.backoff.reset();
                    }
                    Err(e) => {
                        let delay = self.backoff.next_delay();
                        warn!("device plugin not serving, retrying in {delay:?}: {e:#}");
                        retry_at = Some(time::Instant::now() + delay);
                    }
                }
            }

            tokio::select! {
                _ = time::sleep_until(retry_at.unwrap_or_else(time::Instant::now)), if retry_at.is_some() => {
                    retry_at = None;
                }
                event = self.watcher.next() => match event {
                    Some(Ok(event)) => {
                        if is_kubelet_restart(&event, &kubelet_socket) {
                            info!(
                                "inotify: {} created, restarting",
                                kubelet_socket.display()
                            );
                            needs_start = true;
                            retry_at = None;
                            self.backoff.reset();
                        } else {
                            debug!("inotify: {event:?}");
                        }
                    }
                    Some(Err(e)) => warn!("inotify: {e}"),
                    None => bail!("filesystem watcher stopped unexpectedly"),
                },
                _ = self.sighup.recv() => {
                    info!("received SIGHUP, restarting");
                    needs_start = true;
                    retry_at = None;
                    self.backoff.reset();
                }
                _ = self.sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = self.sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = self.sigquit.recv() => {
                    info!("received SIGQUIT, shutting down");
                    break;
                }
            }
        }

        self.teardown().await;
        Ok(())
    }

    /// One full cycle: discover devices, start the server, register. On
    /// failure the partially started session has already cleaned up after
    /// itself, so the instance can simply be dropped.
    async fn try_serve(&mut self) -> anyhow::Result<()> {
        let mut plugin = match RdmaDevicePlugin::new(self.config.clone()) {
            Ok(Some(plugin)) => plugin,
            Ok(None) => bail!("no RDMA devices found"),
            Err(e) => bail!("device discovery failed: {e:?}"),
        };
        info!("discovered RDMA devices: {:?}", plugin.device_ids());

        plugin.serve().await?;
        self.plugin = Some(plugin);
        Ok(())
    }

    async fn teardown(&mut self) {
        if let Some(mut plugin) = self.plugin.take() {
            if let Err(e) = plugin.stop().await {
                warn!("failed to stop device plugin cleanly: {e:#}");
            }
        }
    }
}
