pub mod anomaly;
pub mod chain;
pub mod issues;
pub mod session;
pub mod snapshot;

mod service;

pub use service::AnalysisService;
