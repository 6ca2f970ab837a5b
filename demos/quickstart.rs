use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use webpilot::{BrowserConfig, Chromium, Pilot, PilotConfig, VisionClient, VisionConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let task = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Go to google.com and search for 'weather in New York'".to_string());

    let pilot = Pilot::new(VisionClient::new(VisionConfig::default()), PilotConfig::default());
    let surface = Chromium::new(BrowserConfig { headless: false, user_agent: None });

    // Ctrl-C aborts the run; the browser is still torn down.
    let cancel = CancellationToken::new();
    let guard = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        guard.cancel();
    });

    let report = pilot.run_with_cancel(&task, surface, cancel).await?;
    println!(
        "run {} ended {:?} after {} iterations",
        report.run_id, report.status, report.iterations
    );
    Ok(())
}
