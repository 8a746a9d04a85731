//! Deterministic textual form of a module.
//!
//! Equal modules print equal text, so tests compare schedules by comparing
//! `print_module` outputs instead of walking two arenas in lockstep.

use crate::ir::expr::ForKind;
use crate::ir::module::{IrModule, NodeId, NodeKind};
use crate::utils::CodeFormatter;

/// Render every function body of the module.
pub fn print_module(module: &IrModule) -> String {
    let mut fmt = CodeFormatter::default_indent();
    for &root in module.roots() {
        print_node(module, root, &mut fmt);
    }
    fmt.finish()
}

/// Render one subtree.
pub fn print_subtree(module: &IrModule, root: NodeId) -> String {
    let mut fmt = CodeFormatter::default_indent();
    print_node(module, root, &mut fmt);
    fmt.finish()
}

fn for_header(var: &str, extent: i64, kind: &ForKind) -> String {
    let qual = match kind {
        ForKind::Serial => String::new(),
        ForKind::Parallel => " parallel".to_string(),
        ForKind::Vectorized { factor } => format!(" vectorize[{}]", factor),
        ForKind::Unrolled => " unroll".to_string(),
        ForKind::Bound { axis } => format!(" bind[{}]", axis),
    };
    format!("for{} {} in 0..{} {{", qual, var, extent)
}

fn print_node(module: &IrModule, id: NodeId, fmt: &mut CodeFormatter) {
    match module.kind(id) {
        NodeKind::For {
            var,
            extent,
            kind,
            body,
        } => {
            fmt.writeln(&for_header(var, *extent, kind));
            fmt.indent();
            print_node(module, *body, fmt);
            fmt.dedent();
            fmt.writeln("}");
        }
        NodeKind::Block {
            name,
            iter_vars,
            bindings,
            annotations,
            body,
        } => {
            let vars: Vec<String> = iter_vars
                .iter()
                .zip(bindings.iter())
                .map(|(v, b)| {
                    let marker = if v.is_reduce { "reduce " } else { "" };
                    format!("{}{} = {}", marker, v.name, b)
                })
                .collect();
            fmt.writeln(&format!("block {}({}) {{", name, vars.join(", ")));
            fmt.indent();
            for (key, value) in annotations {
                fmt.writeln(&format!("@{} = {}", key, value));
            }
            print_node(module, *body, fmt);
            fmt.dedent();
            fmt.writeln("}");
        }
        NodeKind::Seq { children } => {
            for &child in children {
                print_node(module, child, fmt);
            }
        }
        NodeKind::Store {
            tensor,
            indices,
            value,
        } => {
            let idx: Vec<String> = indices.iter().map(|e| e.to_string()).collect();
            fmt.writeln(&format!("{}[{}] = {}", tensor, idx.join(", "), value));
        }
        NodeKind::SyncThreads => {
            fmt.writeln("sync_threads()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::expr::{IterVar, ScalarExpr};
    use crate::ir::module::IrModule;

    #[test]
    fn test_print_nest() {
        let mut m = IrModule::new();
        let store = m.alloc(NodeKind::Store {
            tensor: "B".to_string(),
            indices: vec![ScalarExpr::var("i0")],
            value: ScalarExpr::load("A", vec![ScalarExpr::var("i0")]),
        });
        let block = m.mk_block(
            "B".to_string(),
            vec![IterVar::spatial("i0")],
            vec![ScalarExpr::var("i")],
            store,
        );
        let l = m.mk_for("i".to_string(), 16, ForKind::Serial, block);
        let root = m.mk_block("root_0".to_string(), vec![], vec![], l);
        m.add_root(root);

        let text = print_module(&m);
        assert_eq!(
            text,
            "block root_0() {\n  for i in 0..16 {\n    block B(i0 = i) {\n      B[i0] = A[i0]\n    }\n  }\n}\n"
        );
    }

    #[test]
    fn test_equal_modules_print_equal() {
        let mut m = IrModule::new();
        let store = m.alloc(NodeKind::Store {
            tensor: "B".to_string(),
            indices: vec![ScalarExpr::var("i0")],
            value: ScalarExpr::int(0),
        });
        let block = m.mk_block(
            "B".to_string(),
            vec![IterVar::spatial("i0")],
            vec![ScalarExpr::var("i")],
            store,
        );
        let l = m.mk_for("i".to_string(), 8, ForKind::Parallel, block);
        let root = m.mk_block("root_0".to_string(), vec![], vec![], l);
        m.add_root(root);
        assert_eq!(print_module(&m), print_module(&m.clone()));
    }
}
