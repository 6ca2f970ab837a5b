pub mod agent;
pub mod browser;
pub mod vision;

pub use agent::{
    Action, Chromium, Decider, Pilot, PilotConfig, PilotError, RunReport, RunStatus, Session,
    Snapshot, Surface,
};
pub use browser::{Browser, BrowserConfig};
pub use vision::{VisionClient, VisionConfig};
