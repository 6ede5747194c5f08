//! Rate limiting logic and counter state management.

pub mod clock;
pub mod counter;
pub mod key;
pub mod limiter;
pub mod policy;
pub mod quota;
pub mod redis_store;
pub mod routes;
pub mod store;
pub mod subject;

pub use clock::{Clock, MockClock, SystemClock};
pub use counter::{MemoryStore, WindowState};
pub use key::RateLimitKey;
pub use limiter::{Decision, RateLimiter};
pub use policy::{Checkpoint, RateLimitPolicy};
pub use quota::RequestQuota;
pub use redis_store::RedisStore;
pub use routes::{RoutePolicies, RouteTable};
pub use store::{CounterStore, WindowStatus};
pub use subject::{RequestContext, RequestInfo};
