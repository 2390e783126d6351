//! Task graph construction: nodes, handles, the builder and visualization.

mod builder;
mod node;
mod render;

pub use builder::{GraphBuilder, SinkPolicy, TaskBuilder, TaskGraph};
pub use node::{CallArgs, TaskFn, TaskHandle, TaskInput, TaskNode, TaskOptions, TaskValue};
pub use render::render_png;
