pub mod engine;

mod context;
mod conversions;
mod pool;

#[cfg(test)]
mod tests;

pub use engine::{BoaEngine, CompiledScript, Engine, EngineMode};
