//! Static type declarations for the script side of a component.
//!
//! The generated text is a pure function of the schema so it can be compared
//! byte-for-byte to decide whether the on-disk declaration file needs a write.

use std::fmt::Write;

use crate::schema::{Access, ParameterSchema, ParameterSlot};

/// Relative path of the declaration file inside a script source tree.
pub const DECLARATION_FILE: &str = "types/component.d.ts";

const HEADER: &str = "\
// Generated by weft from the component's parameters.
// Edits to this file are overwritten whenever the parameters change.
";

const TREE_CLASS: &str = "\
declare class DataTree<T = any> {
  constructor(branches?: Array<{ path: number[]; items: T[] }>);
  readonly branches: Array<{ path: number[]; items: T[] }>;
  get(path: number[]): T[] | undefined;
  add(path: number[], item: T): void;
  paths(): number[][];
}
";

const CONTEXT_TYPE: &str = "\
  type Context = {
    component: string;
    epoch: number;
  };
";

/// Render the declaration file for `schema`.
///
/// Every slot occupies exactly one line, so changing one slot changes only
/// that slot's line.
pub fn generate_type_declarations(schema: &ParameterSchema) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str(HEADER);
    out.push('\n');
    out.push_str(TREE_CLASS);
    out.push('\n');
    out.push_str("declare namespace Component {\n");
    write_slot_type(&mut out, "Inputs", schema.inputs());
    out.push('\n');
    write_slot_type(&mut out, "Outputs", schema.outputs());
    out.push('\n');
    out.push_str(CONTEXT_TYPE);
    out.push_str("}\n");
    out
}

fn write_slot_type(out: &mut String, name: &str, slots: &[ParameterSlot]) {
    let _ = writeln!(out, "  type {name} = {{");
    for slot in slots {
        out.push_str(&slot_line(slot));
        out.push('\n');
    }
    out.push_str("  };\n");
}

/// The single declaration line for one slot.
pub fn slot_line(slot: &ParameterSlot) -> String {
    let optional = if slot.optional { "?" } else { "" };
    let doc = doc_text(slot);
    let doc = if doc.is_empty() {
        String::new()
    } else {
        format!("/** {doc} */ ")
    };
    format!(
        "    {doc}{}{optional}: {};",
        slot.variable_name,
        declared_type(slot)
    )
}

fn declared_type(slot: &ParameterSlot) -> String {
    let scalar = slot.type_hint.declared_type();
    match slot.access {
        Access::Item => scalar.to_string(),
        Access::List => format!("{scalar}[]"),
        Access::Tree => format!("DataTree<{scalar}>"),
    }
}

fn doc_text(slot: &ParameterSlot) -> String {
    let description = sanitize(&slot.description);
    match &slot.display_name {
        Some(display) => {
            let display = sanitize(display);
            if description.is_empty() {
                display
            } else {
                format!("{display}: {description}")
            }
        }
        None => description,
    }
}

/// Keep free text from closing the doc comment or breaking the line.
fn sanitize(text: &str) -> String {
    text.replace("*/", "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Side, TypeHint};

    #[test]
    fn generation_is_deterministic() {
        let schema = ParameterSchema::default();
        assert_eq!(
            generate_type_declarations(&schema),
            generate_type_declarations(&schema.clone())
        );
    }

    #[test]
    fn type_hint_change_touches_one_line() {
        let before_schema = ParameterSchema::default();
        let mut after_schema = before_schema.clone();
        after_schema
            .set_type_hint(Side::Input, 1, TypeHint::Number)
            .unwrap();

        let before = generate_type_declarations(&before_schema);
        let after = generate_type_declarations(&after_schema);
        let before: Vec<_> = before.lines().collect();
        let after: Vec<_> = after.lines().collect();
        assert_eq!(before.len(), after.len());

        let changed: Vec<_> = before
            .iter()
            .zip(&after)
            .filter(|(a, b)| a != b)
            .map(|(_, b)| *b)
            .collect();
        assert_eq!(changed, ["    /** Input script variable */ b?: number;"]);
    }

    #[test]
    fn access_modes_shape_the_type() {
        let list = ParameterSlot::new("pts")
            .with_access(Access::List)
            .with_type_hint(TypeHint::Host("Point3d".into()));
        assert_eq!(slot_line(&list), "    pts: Point3d[];");

        let tree = ParameterSlot::new("t").with_access(Access::Tree).optional(true);
        assert!(slot_line(&tree).ends_with("t?: DataTree<any>;"));
    }

    #[test]
    fn descriptions_cannot_close_the_comment() {
        let mut slot = ParameterSlot::new("a");
        slot.description = "ends */ early\nand wraps".into();
        slot.display_name = Some("Alpha".into());
        assert_eq!(slot_line(&slot), "    /** Alpha: ends early and wraps */ a: any;");
    }

    #[test]
    fn output_channel_is_not_declared() {
        let text = generate_type_declarations(&ParameterSchema::default());
        assert!(!text.contains(" out"));
        assert!(text.contains("  type Outputs = {\n    /** Output script variable */ x?: any;\n  };"));
    }
}
