//! Rate limiting logic and state management.

mod limiter;
mod policy;
mod reaper;
mod window;

pub use limiter::Limiter;
pub use policy::{Policy, PolicyLimiter, PolicySet, TimeUnit};
pub use reaper::ReaperState;
pub use window::WindowState;
