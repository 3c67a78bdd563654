//! Transaction monitoring.
//!
//! A [`TransactionMonitor`] attaches to a manager through ordinary hooks and
//! keeps a bounded history of lifecycle events plus the latest metrics of
//! every transaction it has seen.
//!
//! # Usage
//!
//! ```ignore
//! use txsaga::monitor::{EventFilter, EventKind, TransactionMonitor};
//!
//! let monitor = TransactionMonitor::new();
//! monitor.attach(&manager);
//!
//! let subscription = monitor.subscribe(|event| println!("{} {}", event.kind, event.transaction_id));
//! manager.execute(work).await?;
//!
//! let rollbacks = monitor.events(&EventFilter::new().kind(EventKind::Rollback));
//! println!("{}", monitor.export_metrics()?);
//! subscription.unsubscribe();
//! ```

mod error;
mod event;
#[allow(clippy::module_inception)]
mod monitor;

pub use error::{MonitorError, MonitorResult};
pub use event::{EventFilter, EventKind, TransactionEvent};
pub use monitor::{
    EventListener, MonitorConfig, Subscription, TransactionMonitor, TransactionStatistics,
};
