use std::process::ExitCode;
use tracing::error;
use whimsy::app::{self, ControlPanel, WINDOW_TITLE};
use whimsy::config::{ReportingConfig, log_dir};
use whimsy::control::Layout;
use whimsy::telemetry::Telemetry;

fn main() -> ExitCode {
    // Only the reporting DSN matters here; mail settings are the CLI's concern.
    let reporting = ReportingConfig::load();

    let _telemetry = match Telemetry::init(&log_dir(), reporting.sentry_dsn()) {
        Ok(t) => {
            t.install_panic_hook();
            Some(t)
        }
        Err(e) => {
            eprintln!("logging disabled: {e}");
            None
        }
    };

    let layout = match Layout::detect().and_then(|l| l.ensure_cli().map(|()| l)) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Cannot start control panel");
            app::show_error(&e.to_string());
            return ExitCode::FAILURE;
        }
    };

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(WINDOW_TITLE)
            .with_inner_size([400.0, 320.0])
            .with_resizable(false),
        ..Default::default()
    };

    if let Err(e) = eframe::run_native(
        WINDOW_TITLE,
        options,
        Box::new(|_cc| Ok(Box::new(ControlPanel::new(layout)))),
    ) {
        error!(error = %e, "Control panel exited with an error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
