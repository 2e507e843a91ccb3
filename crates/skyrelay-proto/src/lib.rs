pub mod link;
pub mod telemetry;
