// Library crate - inside-bar breakout trading core

pub mod bars;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod pattern;
pub mod planner;
pub mod scheduler;
pub mod sizing;
pub mod watchlist;

// Re-export commonly used types
pub use bars::{Bar, BarCache, BarRequest, BarSize, BarWindow};
pub use clock::{Clock, ManualClock, SessionClock, SessionHours, SessionPhase, SystemClock, TimeOfDay};
pub use config::TraderConfig;
pub use error::{TradeError, TradeResult};
pub use gateway::{BrokerGateway, PaperGateway};
pub use pattern::{DetectorVariant, PatternDetector, Setup, Signal};
pub use planner::{BracketPlan, EntryStyle, Leg, OrderPlanner};
pub use scheduler::{Scheduler, SchedulerEvent, SessionOutcome, SessionReport, SessionSummary, ShutdownHandle};
pub use sizing::{size, PriceTier, PriceTierTable};
pub use watchlist::{EntryState, InvalidationReason, Watchlist};
