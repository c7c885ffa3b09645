use crate::control::{self, Action, ActionOutcome, Layout, ScheduleStatus};
use eframe::egui;
use rfd::{MessageButtons, MessageDialog, MessageDialogResult, MessageLevel};
use std::sync::mpsc::{Receiver, TryRecvError};

pub const WINDOW_TITLE: &str = "Whimsy Control Panel";

pub struct ControlPanel {
    layout: Layout,
    status: ScheduleStatus,

    // In-flight action, if any
    outcome_rx: Option<Receiver<ActionOutcome>>,
    running: Option<Action>,
}

impl ControlPanel {
    pub fn new(layout: Layout) -> Self {
        let mut panel = Self {
            layout,
            status: ScheduleStatus::Unknown,
            outcome_rx: None,
            running: None,
        };
        panel.refresh_status();
        panel
    }

    fn refresh_status(&mut self) {
        self.status = ScheduleStatus::of_descriptor(&self.layout.descriptor);
    }

    fn start(&mut self, ctx: &egui::Context, action: Action) {
        if let Some(question) = action.confirmation() {
            if !confirm(question) {
                return;
            }
        }
        let ctx = ctx.clone();
        self.outcome_rx = Some(control::spawn(action, self.layout.clone(), move || {
            ctx.request_repaint()
        }));
        self.running = Some(action);
    }

    fn poll_outcome(&mut self) {
        let Some(rx) = &self.outcome_rx else {
            return;
        };
        let result = match rx.try_recv() {
            Ok(outcome) => outcome.result.map(|()| outcome.action.success_message()),
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => Err(control::PanelError::Panicked(
                "worker exited without a result".to_string(),
            )),
        };

        self.outcome_rx = None;
        self.running = None;
        match result {
            Ok(message) => show_info(message),
            Err(e) => show_error(&e.to_string()),
        }
        self.refresh_status();
    }
}

impl eframe::App for ControlPanel {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll_outcome();

        // --- Footer ---
        egui::TopBottomPanel::bottom("footer").show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                ui.colored_label(egui::Color32::from_rgb(170, 170, 170), "Made with love");
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                ui.add_space(16.0);
                ui.heading(egui::RichText::new("❤️ Whimsy for My Queen").strong().size(20.0));
                ui.add_space(16.0);

                // --- Status ---
                ui.colored_label(status_color(self.status), self.status.label());
                ui.add_space(16.0);

                // --- Actions ---
                let idle = self.running.is_none();
                let mut clicked = None;

                if ui
                    .add_enabled(idle, action_button("💌 Send One Email Now"))
                    .clicked()
                {
                    clicked = Some(Action::SendNow);
                }
                if ui
                    .add_enabled(
                        idle && self.status.can_install(),
                        action_button("✅ Install Daily Schedule (08:00)"),
                    )
                    .clicked()
                {
                    clicked = Some(Action::Install);
                }
                if ui
                    .add_enabled(
                        idle && self.status.can_uninstall(),
                        action_button("🛑 Stop/Uninstall Schedule"),
                    )
                    .clicked()
                {
                    clicked = Some(Action::Uninstall);
                }

                if let Some(action) = self.running {
                    ui.add_space(8.0);
                    ui.horizontal(|ui| {
                        ui.spinner();
                        ui.label(progress_label(action));
                    });
                }

                if let Some(action) = clicked {
                    self.start(ctx, action);
                }
            });
        });
    }
}

fn action_button(text: &str) -> egui::Button<'_> {
    egui::Button::new(egui::RichText::new(text).size(15.0)).min_size(egui::vec2(280.0, 32.0))
}

fn status_color(status: ScheduleStatus) -> egui::Color32 {
    match status {
        ScheduleStatus::Unknown => egui::Color32::GRAY,
        ScheduleStatus::Installed => egui::Color32::from_rgb(40, 160, 60),
        ScheduleStatus::NotInstalled => egui::Color32::from_rgb(176, 0, 32),
    }
}

fn progress_label(action: Action) -> &'static str {
    match action {
        Action::SendNow => "Sending...",
        Action::Install => "Installing...",
        Action::Uninstall => "Uninstalling...",
    }
}

fn confirm(question: &str) -> bool {
    MessageDialog::new()
        .set_title("Confirm")
        .set_description(question)
        .set_level(MessageLevel::Info)
        .set_buttons(MessageButtons::YesNo)
        .show()
        == MessageDialogResult::Yes
}

pub fn show_info(message: &str) {
    MessageDialog::new()
        .set_title("Success")
        .set_description(message)
        .set_level(MessageLevel::Info)
        .set_buttons(MessageButtons::Ok)
        .show();
}

pub fn show_error(message: &str) {
    MessageDialog::new()
        .set_title("Error")
        .set_description(message)
        .set_level(MessageLevel::Error)
        .set_buttons(MessageButtons::Ok)
        .show();
}
