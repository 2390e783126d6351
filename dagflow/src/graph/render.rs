//! Graph visualization through Graphviz.
//!
//! Rendering shells out to the `dot` executable. A missing toolchain is
//! reported as [`DagflowError::RenderingUnavailable`], distinct from other
//! failures, and never affects graph execution.

use super::builder::TaskGraph;
use crate::errors::{DagflowError, Result};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

impl TaskGraph {
    /// Renders the graph as Graphviz DOT text.
    ///
    /// Output is deterministic: nodes appear in creation order and the
    /// terminal node is highlighted.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph tasks {\n  rankdir=LR;\n");

        for (index, node) in self.nodes().iter().enumerate() {
            let shape = if index == self.terminal().node_index() {
                ", shape=doubleoctagon"
            } else {
                ""
            };
            dot.push_str(&format!(
                "  n{index} [label=\"{}\"{shape}];\n",
                node.name().replace('"', "\\\"")
            ));
        }

        for (index, node) in self.nodes().iter().enumerate() {
            for handle in node.input_handles() {
                match handle.output_index() {
                    Some(output) => dot.push_str(&format!(
                        "  n{} -> n{index} [label=\"[{output}]\"];\n",
                        handle.node_index()
                    )),
                    None => {
                        dot.push_str(&format!("  n{} -> n{index};\n", handle.node_index()));
                    }
                }
            }
        }

        dot.push_str("}\n");
        dot
    }
}

/// Renders a task graph to a PNG image at `output`.
///
/// # Errors
///
/// Returns [`DagflowError::RenderingUnavailable`] when the `dot` executable
/// is not installed, and ordinary errors for any other failure.
pub fn render_png(graph: &TaskGraph, output: impl AsRef<Path>) -> Result<()> {
    let mut child = Command::new("dot")
        .arg("-Tpng")
        .arg("-o")
        .arg(output.as_ref())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                DagflowError::RenderingUnavailable
            } else {
                DagflowError::Io(err)
            }
        })?;

    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(graph.to_dot().as_bytes())?;
    }

    let status = child.wait()?;
    if status.success() {
        Ok(())
    } else {
        Err(DagflowError::Internal(format!(
            "dot exited with status {status}"
        )))
    }
}
