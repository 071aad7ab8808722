//! Fuzzer module - bulk and queued requests with per-scan completion tracking
//!
//! Templated requests are expanded into payload combinations and drained by
//! a fixed pool of workers. Every request counts against its scan in the
//! [`RequestTracker`], which closes the scan's signal once it drains or is
//! cancelled.

mod payloads;
mod pool;
mod requests;
mod template;
mod tracker;

pub use payloads::{sniper_combinations, PayloadSource};
pub use pool::{BulkReport, BulkRequest, BulkRequestPool, Dispatch, RequestMeta, SiteDispatcher};
pub use requests::{site_url, InjectionRun, MakeRequest, QueuedRequest, RequestRunner};
pub use template::{RequestPart, RequestTemplate, Spliced};
pub use tracker::{QueueableOperation, RequestTracker, ScanSignal};
