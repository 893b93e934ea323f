pub mod queue;
pub mod scorer;
pub mod uncertainty;

pub use queue::{QueueError, ReviewQueue, SampleCandidate, Suggestion};
pub use scorer::{PriorityBreakdown, PriorityScorer};
pub use uncertainty::{strategy_from_name, Entropy, LeastConfident, Margin, UncertaintyStrategy};
