//! Background loops that keep the pool registry in line with the backends:
//! per-pool health probing, and discovery of live instances in dynamic mode.

pub mod health;
pub mod probe;
pub mod reconcile;
pub mod source;

pub use health::{HealthMonitor, HealthReport};
pub use probe::{Prober, TcpProber};
pub use reconcile::{ReconcileReport, Reconciler};
pub use source::{HttpInstanceSource, InstanceSource, LiveInstance, Selector};
