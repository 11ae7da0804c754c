//! Job description, pump scheduling and end-to-end orchestration.

pub mod cancel;
pub mod exporter;
pub mod job;
pub mod scheduler;
pub mod session;

pub use cancel::CancellationToken;
pub use exporter::{ExportOutcome, ExportReport, Exporter, choose_site};
pub use job::ExportJob;
pub use scheduler::{PumpReport, run_pumps};
pub use session::{EditingSession, ExportHandle, SessionPolicy};
