//! Core building blocks shared by every layer: request/response types, the
//! error taxonomy, the plain HTTP transport and the backend result parser.

pub mod error;
pub mod http_client;
pub mod parser;
pub mod types;

pub use error::{FailureKind, OrchestratorError, OrchestratorResult};
pub use http_client::{
    EARLY_FAILURE_WINDOW, HttpResponse, PageHttpClient, ReqwestPageClient, TransportError,
};
pub use parser::{ParseError, has_result_markup, page_title, parse_results, resolve_href};
pub use types::{
    BatchOptions, BatchResult, FetchOptions, FetchOutcome, OutputFormat, RenderMode,
    RenderedBy, SafeSearch, SearchOptions, SearchResult, TimeRange,
};
