//! Compiles metric query rows into calls against the remote metrics API,
//! executes them and maps the returned series back onto the rows.
//!
//! The pipeline, per region:
//!
//! 1. [`query`]: rows are validated and expanded into one [`Query`] per
//!    statistic, then classified.
//! 2. [`wildcard`]: wildcarded dimensions are resolved to concrete values
//!    through a shared TTL cache.
//! 3. [`planner`]: queries are packed into batches honoring the per-call
//!    limits of the API, with insights queries isolated from each other.
//! 4. [`executor`]: each batch is fetched page by page.
//! 5. [`reconcile`]: pages are merged back into one series per query and
//!    label, and named by [`alias`].
//!
//! [`service::QueryService`] runs the pipeline with one worker per region.

pub mod alias;
pub mod executor;
pub mod planner;
pub mod query;
pub mod reconcile;
pub mod response;
pub mod search_expression;
pub mod service;
pub mod wildcard;

pub use query::{Query, QueryMode, QueryRow, TimeRange};
pub use response::{Point, QueryResponse, RefIdResult, Series};
pub use service::QueryService;
