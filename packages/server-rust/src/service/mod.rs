//! Request handling: application definition, routing, per-request context,
//! health aggregation and response formatting.
//!
//! 1. **App** (`app`): routes, backends, probes and middleware collected before boot
//! 2. **Routing** (`router`): method + path-template table, frozen at boot
//! 3. **Context** (`context`): pooled per-request state
//! 4. **Dispatch** (`dispatch`): the innermost tower service
//! 5. **Formatting** (`respond`): outcome -> wire response
//! 6. **Health** (`health`): backend and probe aggregation

pub mod app;
pub mod context;
pub mod dispatch;
pub mod health;
pub mod respond;
pub mod router;

pub use app::{App, Middleware};
pub use context::{ContextPool, PoolStats, PooledContext, RequestContext};
pub use dispatch::{Dispatcher, MatchedRoute};
pub use health::HealthRegistry;
pub use respond::{Encoding, Outcome, ResponseFormatter};
pub use router::{handler_fn, HandlerFn, Resolution, RouteError, RouteTable};
