//! Flow graphs and their execution: validation, templating, the worklist
//! interpreter, and scheduled delay resumption.

pub mod delay;
pub mod graph;
pub mod interpreter;
pub mod template;

pub use delay::{DelayScheduler, ResumeDue};
pub use graph::{FlowGraph, FlowNode, NodeKind, TriggerKeywords};
pub use interpreter::{FlowInterpreter, RunOutcome, RunParams};
pub use template::TemplateContext;
