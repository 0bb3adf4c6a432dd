pub mod context;
pub mod engine;
pub mod executor;
pub mod learner;
pub mod reflection;
pub mod resolver;
pub mod router;

pub use context::ContextBuilder;
pub use engine::{EvolutionEngine, RunResult};
pub use executor::NodeExecutor;
pub use learner::{InteractiveLearner, SimulatedLearner};
pub use resolver::{ProviderHandle, ProviderResolver};
pub use router::TransitionRouter;
