//! Advisor Voice: realtime voice conversation core.
//!
//! Driven by a desktop host over JSON-line IPC on stdin/stdout. Loads the
//! configuration and persona tables, builds one session controller on the
//! system audio devices and forwards its state, text and transcript
//! streams to the host.

mod logger;

use std::sync::{Arc, Weak};

use anyhow::Context;
use tracing::{info, warn};

use advisor_voice::audio::{list_input_devices, list_output_devices};
use advisor_voice::config::{
    credential_from_env, read_voice_config, ConnectionConfig, PersonaDirectory, VoiceConfig,
    VoiceProfiles,
};
use advisor_voice::events::Subscription;
use advisor_voice::ipc::bridge::{emit_error, emit_event, emit_voice_error, spawn_stdin_reader};
use advisor_voice::ipc::{AudioDeviceInfo, PersonaInfo, VoiceCommand, VoiceEvent};
use advisor_voice::session::{DeviceBackend, SessionController};

struct App {
    controller: Arc<SessionController>,
    config: VoiceConfig,
    personas: PersonaDirectory,
    profiles: VoiceProfiles,
    _subscriptions: Vec<Subscription>,
}

impl App {
    fn new(config: VoiceConfig) -> Self {
        let (personas, profiles) = config.directories();
        let devices = DeviceBackend::new(
            config.input_device.clone(),
            config.output_device.clone(),
            config.output_volume(),
        );
        let controller = Arc::new(SessionController::with_devices(devices));
        let subscriptions = forward_events(&controller);
        Self {
            controller,
            config,
            personas,
            profiles,
            _subscriptions: subscriptions,
        }
    }

    /// Resolve `persona` (or the configured default) into a connection
    /// config.
    fn connection_config(&self, persona: Option<&str>) -> Result<ConnectionConfig, String> {
        let requested = persona.or(self.config.default_persona.as_deref());
        let persona = match requested {
            Some(id) => self
                .personas
                .get(id)
                .ok_or_else(|| format!("Unknown persona: {id}"))?,
            None => self
                .personas
                .first()
                .ok_or_else(|| "No personas configured".to_string())?,
        };
        ConnectionConfig::for_persona(persona, &self.profiles, &self.config, credential_from_env())
            .map_err(|e| e.to_string())
    }

    /// Handle a single command. Returns `false` if the main loop should exit.
    async fn handle_command(&self, cmd: VoiceCommand) -> bool {
        match cmd {
            VoiceCommand::Ping {} => {
                emit_event(&VoiceEvent::Pong {});
            }

            VoiceCommand::Stop {} => {
                emit_event(&VoiceEvent::Stopping {});
                return false;
            }

            VoiceCommand::Connect { persona } => {
                let config = match self.connection_config(persona.as_deref()) {
                    Ok(config) => config,
                    Err(message) => {
                        warn!("{}", message);
                        emit_error(&message);
                        return true;
                    }
                };
                info!(?config, "Connect requested");
                // The handshake can take seconds; keep the command loop free.
                let controller = Arc::clone(&self.controller);
                tokio::spawn(async move {
                    if let Err(e) = controller.connect(config).await {
                        emit_voice_error(&e);
                    }
                });
            }

            VoiceCommand::Disconnect {} => {
                self.controller.disconnect().await;
            }

            VoiceCommand::StartListening {} => {
                let controller = Arc::clone(&self.controller);
                tokio::spawn(async move {
                    if let Err(e) = controller.start_listening().await {
                        emit_voice_error(&e);
                    }
                });
            }

            VoiceCommand::StopListening {} => {
                self.controller.stop_listening();
            }

            VoiceCommand::SendText { text } => {
                self.controller.send_text(&text);
            }

            VoiceCommand::Interrupt {} => {
                self.controller.interrupt();
            }

            VoiceCommand::SetVolume { volume } => {
                self.controller.set_volume(volume.clamp(0.0, 2.0));
            }

            VoiceCommand::ListAudioDevices {} => {
                let (input, output) = tokio::task::spawn_blocking(|| {
                    (list_input_devices(), list_output_devices())
                })
                .await
                .unwrap_or_default();
                emit_event(&VoiceEvent::AudioDevices {
                    input: AudioDeviceInfo::from_names(input),
                    output: AudioDeviceInfo::from_names(output),
                });
            }

            VoiceCommand::ListPersonas {} => {
                let personas = self
                    .personas
                    .iter()
                    .map(|p| PersonaInfo::new(p, self.profiles.voice_for(p)))
                    .collect();
                emit_event(&VoiceEvent::Personas {
                    personas,
                    default_persona: self.config.default_persona.clone(),
                });
            }
        }

        true
    }
}

/// Mirror controller events onto stdout.
fn forward_events(controller: &Arc<SessionController>) -> Vec<Subscription> {
    let weak: Weak<SessionController> = Arc::downgrade(controller);
    vec![
        controller.subscribe(move |patch| {
            let Some(controller) = weak.upgrade() else {
                return;
            };
            emit_event(&VoiceEvent::StateChange {
                patch: patch.clone(),
                phase: controller.phase(),
            });
        }),
        controller.on_text(|text| {
            emit_event(&VoiceEvent::Text { text: text.clone() });
        }),
        controller.on_transcript(|entry| {
            emit_event(&VoiceEvent::Transcript {
                entry: entry.clone(),
            });
        }),
        controller.on_tool_call(|call| {
            emit_event(&VoiceEvent::ToolCall { call: call.clone() });
        }),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init().context("failed to initialize logging")?;

    // Emit starting event immediately so the host knows we're alive.
    emit_event(&VoiceEvent::Starting {});

    let config = read_voice_config();
    info!(
        model = ?config.model,
        personas = config.personas.len(),
        has_key = credential_from_env().is_some() || config.api_key.is_some(),
        "Configuration loaded"
    );
    let app = App::new(config);
    let mut cmd_rx = spawn_stdin_reader();

    emit_event(&VoiceEvent::Ready {});
    info!("Voice core ready");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(command) => {
                        if !app.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        info!("stdin closed, shutting down");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    app.controller.disconnect().await;
    info!("Voice core shutting down");
    Ok(())
}
