//! The core data model: pipelines, scanners, signals, executions, and the
//! in-flight pipeline state that flows through the agent chain.

pub mod candle;
pub mod execution;
pub mod pipeline;
pub mod pipeline_state;
pub mod scanner;
pub mod signal;

pub use candle::{Candle, Timeframe};
pub use execution::{AgentState, AgentStatus, Execution, ExecutionPhase, ExecutionStatus, Mode};
pub use pipeline::{AgentNodeConfig, Pipeline, SignalSubscription, TriggerMode};
pub use pipeline_state::{
    Bias, BiasAssessment, PipelineState, RiskAssessment, StrategyAction, StrategyDecision,
    TradeExecution, TradeOutcome,
};
pub use scanner::Scanner;
pub use signal::{Signal, SignalTickerEntry, SignalType};
