use anyhow::{Context, Result};
use eframe::egui;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{
    backend::HttpBackend,
    config::ClientConfig,
    controller::CardReadController,
    health::HealthMonitor,
    state::{ConnectionStatus, OperationState, StatusSnapshot},
    utils::display_atr,
};

const GREEN: egui::Color32 = egui::Color32::from_rgb(0, 170, 80);
const RED: egui::Color32 = egui::Color32::from_rgb(200, 40, 40);
const BLUE: egui::Color32 = egui::Color32::from_rgb(60, 130, 240);

/// Card panel variant shown for an operation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardPanel {
    Waiting,
    Reading,
    Detected,
}

/// Everything the window draws for one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusView {
    pub online: bool,
    pub status_text: &'static str,
    pub panel: CardPanel,
    pub atr: Option<String>,
    pub reader: Option<String>,
    pub error: Option<String>,
    pub button_label: &'static str,
    pub button_enabled: bool,
}

impl StatusView {
    pub fn from_snapshot(snapshot: &StatusSnapshot) -> Self {
        let online = snapshot.connection.is_online();
        let panel = match &snapshot.operation {
            OperationState::Success(_) => CardPanel::Detected,
            OperationState::Reading => CardPanel::Reading,
            OperationState::Idle | OperationState::Error(_) => CardPanel::Waiting,
        };

        Self {
            online,
            status_text: match snapshot.connection {
                ConnectionStatus::Online => "Service running",
                ConnectionStatus::Offline => "Backend not started",
            },
            panel,
            atr: snapshot.card().map(|card| display_atr(&card.atr)),
            reader: snapshot.card().map(|card| card.reader.clone()),
            error: snapshot.error().map(|error| error.message.clone()),
            button_label: if panel == CardPanel::Reading {
                "Communicating..."
            } else {
                "Read IC card"
            },
            button_enabled: snapshot.can_trigger(),
        }
    }
}

/// Window that renders the reader status; it never changes core state
/// except by triggering a read.
pub struct CardReaderApp {
    runtime: tokio::runtime::Runtime,
    monitor: HealthMonitor,
    controller: CardReadController,
    api_url: String,
}

impl CardReaderApp {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        // One worker keeps probes and reads on a single executor thread
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .context("Failed to start async runtime")?;

        let backend = Arc::new(HttpBackend::new(config)?);
        let mut monitor = HealthMonitor::new(backend.clone(), config);
        let controller = CardReadController::new(backend, monitor.subscribe(), config);

        {
            let _guard = runtime.enter();
            monitor.start();
        }

        Ok(Self {
            runtime,
            monitor,
            controller,
            api_url: config.base_url.clone(),
        })
    }
}

impl eframe::App for CardReaderApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let _guard = self.runtime.enter();
        self.controller.poll();
        let snapshot = self.controller.snapshot();
        let view = StatusView::from_snapshot(&snapshot);
        let mut read_clicked = false;

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("IC Card Reader");
            ui.horizontal(|ui| {
                ui.colored_label(if view.online { GREEN } else { RED }, "●");
                ui.label(view.status_text);
                if let Some(at) = snapshot.last_probe_at {
                    ui.weak(format!("checked {}", at.format("%H:%M:%S")));
                }
            });
            ui.separator();

            ui.group(|ui| {
                ui.set_min_height(120.0);
                ui.vertical_centered(|ui| {
                    ui.add_space(30.0);
                    match view.panel {
                        CardPanel::Detected => {
                            ui.colored_label(GREEN, egui::RichText::new("CARD DETECTED").strong());
                        }
                        CardPanel::Reading => {
                            ui.spinner();
                            ui.colored_label(BLUE, "Reading...");
                        }
                        CardPanel::Waiting => {
                            ui.weak("Waiting for action");
                        }
                    }
                });
            });
            ui.add_space(8.0);

            if let (Some(atr), Some(reader)) = (&view.atr, &view.reader) {
                ui.group(|ui| {
                    ui.small("ATR IDENTIFIER");
                    ui.monospace(atr);
                });
                ui.group(|ui| {
                    ui.small("READER DEVICE");
                    ui.label(reader);
                });
            }

            if let Some(message) = &view.error {
                ui.group(|ui| {
                    ui.colored_label(RED, message);
                });
            }

            ui.add_space(8.0);
            let button = egui::Button::new(egui::RichText::new(view.button_label).size(18.0))
                .min_size(egui::vec2(ui.available_width(), 44.0));
            if ui.add_enabled(view.button_enabled, button).clicked() {
                read_clicked = true;
            }

            ui.add_space(8.0);
            ui.weak(format!("Backend: {}", self.api_url));
        });

        if read_clicked {
            self.controller.trigger_read();
        }

        // Probes complete in the background, keep the view fresh
        ctx.request_repaint_after(Duration::from_millis(250));
    }
}

impl Drop for CardReaderApp {
    fn drop(&mut self) {
        self.runtime.block_on(self.monitor.stop());
    }
}

pub fn run_gui(config: ClientConfig) -> Result<()> {
    config.validate()?;
    let app = CardReaderApp::new(&config)?;

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([420.0, 560.0])
            .with_min_inner_size([360.0, 480.0])
            .with_icon(Arc::new(egui::IconData::default())),
        ..Default::default()
    };

    eframe::run_native(
        "IC Card Reader",
        options,
        Box::new(move |_cc| Ok(Box::new(app))),
    )
    .map_err(|e| anyhow::anyhow!("GUI error: {}", e))
}
