use crate::cache::CacheError;
use crate::store::StoreError;

/// Error kinds a routing request can surface to its caller. The engine
/// channel maps these to the `error` parameter of the answered message, the
/// diagnostic endpoint to `routing_status_details`.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no route to {0}")]
    NoRoute(String),
    #[error("forward chain exceeds depth limit of {0}")]
    ForwardLoop(u32),
    #[error("dial-out not permitted towards {0}")]
    Forbidden(String),
    #[error("routing store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("routing cache unavailable: {0}")]
    CacheUnavailable(#[from] CacheError),
    #[error("no cached route for {0}")]
    Gone(String),
    #[error("routing timed out")]
    Timeout,
}

impl RoutingError {
    /// Short code used on the wire and in metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            RoutingError::NoRoute(_) => "noroute",
            RoutingError::ForwardLoop(_) => "forward-loop",
            RoutingError::Forbidden(_) => "forbidden",
            RoutingError::StoreUnavailable(_) => "database",
            RoutingError::CacheUnavailable(_) => "cache-unavailable",
            RoutingError::Gone(_) => "gone",
            RoutingError::Timeout => "timeout",
        }
    }

    /// `NO_ROUTE` is answered unprocessed on the engine channel so that
    /// lower-priority modules still get a chance to route the call.
    pub fn pass_through(&self) -> bool {
        matches!(self, RoutingError::NoRoute(_))
    }
}
