//! The monitor loop: poll the status feed, compare against the previous
//! tick, and drive OBS on changes only.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{BitrateConfig, Config};
use crate::obs::SceneController;
use crate::status::{SrtConnection, StatusError, StatusSource};

/// Observations carried across ticks. Both start unset so the first tick
/// always drives the scene to a known state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MonitorState {
    pub last_publishing: Option<bool>,
    pub last_low_bitrate: Option<bool>,
}

/// What one tick derived and which commands it attempted. Commands that
/// fail downstream still count as attempted; failures are logged, never
/// propagated.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    pub publishing: bool,
    pub low_bitrate: Option<bool>,
    /// Scene name a switch command was issued for, if any.
    pub switched_scene: Option<String>,
    /// Overlay visibility a command was issued for, if any.
    pub overlay_command: Option<bool>,
}

/// The slice of the configuration the loop actually needs.
#[derive(Clone, Debug)]
pub struct MonitorSettings {
    pub check_interval: Duration,
    pub live_scene: String,
    pub fallback_scene: String,
    pub bitrate: BitrateConfig,
}

impl From<&Config> for MonitorSettings {
    fn from(config: &Config) -> Self {
        Self {
            check_interval: config.check_interval(),
            live_scene: config.live_scene.clone(),
            fallback_scene: config.fallback_scene.clone(),
            bitrate: config.bitrate.clone(),
        }
    }
}

pub struct Monitor<C, S> {
    settings: MonitorSettings,
    controller: C,
    status: S,
    state: MonitorState,
}

impl<C: SceneController, S: StatusSource> Monitor<C, S> {
    pub fn new(settings: MonitorSettings, controller: C, status: S) -> Self {
        Self {
            settings,
            controller,
            status,
            state: MonitorState::default(),
        }
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    /// One check-and-react pass. Never fails: feed errors read as "nothing
    /// publishing" (fail toward the fallback scene) and command errors are
    /// logged and swallowed so the timer keeps running.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        let connections = match self.status.list_connections().await {
            Ok(connections) => connections,
            Err(e) => {
                match &e {
                    StatusError::ConnectionRefused => {
                        error!("cannot reach the status endpoint, is the streaming server running?")
                    }
                    StatusError::Timeout => error!("timed out polling the status endpoint"),
                    other => error!("status poll failed: {}", other),
                }
                Vec::new()
            }
        };

        let publish = connections.iter().find(|conn| conn.is_publishing());
        let publishing = publish.is_some();
        report.publishing = publishing;
        if let Some(conn) = publish {
            debug!(
                "active publish connection: id={} rate={:.2} mbps",
                conn.id,
                conn.send_rate()
            );
        } else if !connections.is_empty() {
            debug!("{} connection(s), none publishing", connections.len());
            for conn in &connections {
                debug!("  id={} state={}", conn.id, conn.state);
            }
        }

        let bitrate = &self.settings.bitrate;
        let low_bitrate = if bitrate.enabled && publishing {
            let sampled = connections
                .iter()
                .find(|conn| conn.state == bitrate.connection_role)
                .or(publish);
            let rate = sampled.map(SrtConnection::send_rate).unwrap_or(0.0);
            Some(rate < bitrate.threshold_mbps)
        } else {
            None
        };
        report.low_bitrate = low_bitrate;

        // scene transition: only on change or first observation
        if self.state.last_publishing != Some(publishing) {
            let scene = if publishing {
                &self.settings.live_scene
            } else {
                &self.settings.fallback_scene
            };
            if publishing {
                info!("stream is live, switching to \"{}\"", scene);
            } else {
                info!("stream went offline, switching to \"{}\"", scene);
            }
            report.switched_scene = Some(scene.clone());
            if let Err(e) = self.controller.set_program_scene(scene).await {
                error!("scene switch failed: {}", e);
            }
        }
        self.state.last_publishing = Some(publishing);

        if self.settings.bitrate.enabled {
            match low_bitrate {
                Some(low) => {
                    if self.state.last_low_bitrate != Some(low) {
                        if low {
                            warn!(
                                "bitrate below {:.2} mbps, showing \"{}\"",
                                self.settings.bitrate.threshold_mbps,
                                self.settings.bitrate.overlay_source
                            );
                        } else {
                            info!(
                                "bitrate recovered, hiding \"{}\"",
                                self.settings.bitrate.overlay_source
                            );
                        }
                        report.overlay_command = Some(low);
                        if let Err(e) = self
                            .controller
                            .set_source_visible(
                                &self.settings.live_scene,
                                &self.settings.bitrate.overlay_source,
                                low,
                            )
                            .await
                        {
                            error!("overlay toggle failed: {}", e);
                        }
                        self.state.last_low_bitrate = Some(low);
                    }
                }
                None => {
                    // never leave the warning latched across a disconnect
                    if self.state.last_low_bitrate.is_some() {
                        debug!("publish ended, resetting bitrate overlay");
                        report.overlay_command = Some(false);
                        if let Err(e) = self
                            .controller
                            .set_source_visible(
                                &self.settings.live_scene,
                                &self.settings.bitrate.overlay_source,
                                false,
                            )
                            .await
                        {
                            error!("overlay reset failed: {}", e);
                        }
                        self.state.last_low_bitrate = None;
                    }
                }
            }
        }

        report
    }

    /// Run the loop until the shutdown channel fires. The first tick runs
    /// immediately; a tick that overruns the interval delays the next one
    /// instead of bursting to catch up, so ticks never overlap.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.settings.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "monitor running, checking every {}ms",
            self.settings.check_interval.as_millis()
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    info!("monitor stopping");
                    break;
                }
            }
        }
    }
}
