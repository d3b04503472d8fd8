mod gate;

pub use gate::{evaluate, RiskConfig};
