use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

const IDENTIFIER_PATTERN: &str = "^[a-zA-Z][a-zA-Z0-9_]*$";

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(IDENTIFIER_PATTERN).expect("identifier pattern compiles"));

/// Words a slot variable may not use. Covers the script language's keywords,
/// the type-declaration keywords and the output channel name.
pub const RESERVED_WORDS: &[&str] = &[
    "out", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for",
    "function", "if", "import", "in", "instanceof", "new", "null", "return", "super",
    "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with",
    "as", "implements", "interface", "let", "package", "private", "protected", "public",
    "static", "yield", "any", "boolean", "constructor", "declare", "get", "module",
    "require", "number", "set", "string", "symbol", "type", "from", "of", "namespace",
    "async", "await",
];

/// Variable name of the implicit console output slot.
pub const OUTPUT_CHANNEL_NAME: &str = "out";

const INPUT_NAME_POOL: &str = "abcdefghijklmn";
const OUTPUT_NAME_POOL: &str = "xyzuvwst";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Input,
    Output,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Input => write!(f, "input"),
            Side::Output => write!(f, "output"),
        }
    }
}

/// How a slot consumes or produces data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    Item,
    List,
    Tree,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeHint {
    #[default]
    Any,
    Number,
    String,
    Boolean,
    Date,
    /// A registered host type, shown to scripts under this name.
    Host(String),
}

impl TypeHint {
    /// The scalar type name used in generated declarations.
    pub fn declared_type(&self) -> &str {
        match self {
            TypeHint::Any => "any",
            TypeHint::Number => "number",
            TypeHint::String => "string",
            TypeHint::Boolean => "boolean",
            TypeHint::Date => "Date",
            TypeHint::Host(name) => name,
        }
    }
}

/// One named, typed input or output position on a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSlot {
    pub variable_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub access: Access,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub type_hint: TypeHint,
}

impl ParameterSlot {
    pub fn new(variable_name: impl Into<String>) -> Self {
        Self {
            variable_name: variable_name.into(),
            display_name: None,
            description: String::new(),
            access: Access::Item,
            optional: false,
            type_hint: TypeHint::Any,
        }
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn with_type_hint(mut self, hint: TypeHint) -> Self {
        self.type_hint = hint;
        self
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// Display name, falling back to the variable name.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.variable_name)
    }
}

/// What a schema edit invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchemaChange {
    /// Generated type declarations must be rewritten.
    pub declarations: bool,
    /// Marshalling and execution see a different slot layout.
    pub bindings: bool,
}

impl SchemaChange {
    pub const NONE: SchemaChange = SchemaChange {
        declarations: false,
        bindings: false,
    };
    pub const ALL: SchemaChange = SchemaChange {
        declarations: true,
        bindings: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.declarations && !self.bindings
    }

    pub fn merge(self, other: SchemaChange) -> SchemaChange {
        SchemaChange {
            declarations: self.declarations || other.declarations,
            bindings: self.bindings || other.bindings,
        }
    }
}

/// Ordered input and output slots of a script component.
///
/// Output indices are host-visible indices: when the output channel is
/// enabled it occupies output index 0 and user outputs start at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSchema {
    inputs: Vec<ParameterSlot>,
    outputs: Vec<ParameterSlot>,
    #[serde(default = "default_output_channel")]
    output_channel: bool,
    #[serde(skip)]
    revision: u64,
}

fn default_output_channel() -> bool {
    true
}

impl Default for ParameterSchema {
    /// Two inputs (`a`, `b`), one output (`x`) and the output channel.
    fn default() -> Self {
        let mut schema = Self::empty();
        schema.add_slot(Side::Input);
        schema.add_slot(Side::Input);
        schema.add_slot(Side::Output);
        schema.revision = 0;
        schema
    }
}

impl ParameterSchema {
    /// No user slots; output channel enabled.
    pub fn empty() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            output_channel: true,
            revision: 0,
        }
    }

    pub fn from_slots(
        inputs: Vec<ParameterSlot>,
        outputs: Vec<ParameterSlot>,
        output_channel: bool,
    ) -> Self {
        Self {
            inputs,
            outputs,
            output_channel,
            revision: 0,
        }
    }

    pub fn inputs(&self) -> &[ParameterSlot] {
        &self.inputs
    }

    /// User output slots, excluding the output channel.
    pub fn outputs(&self) -> &[ParameterSlot] {
        &self.outputs
    }

    pub fn output_channel(&self) -> bool {
        self.output_channel
    }

    /// Incremented by every edit that changed something.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Number of host-visible slots on a side, including the output channel.
    pub fn slot_count(&self, side: Side) -> usize {
        match side {
            Side::Input => self.inputs.len(),
            Side::Output => self.outputs.len() + self.channel_offset(Side::Output),
        }
    }

    /// Host-visible output index of the user output at `position`.
    pub fn output_index(&self, position: usize) -> usize {
        position + self.channel_offset(Side::Output)
    }

    pub fn slot(&self, side: Side, index: usize) -> Option<&ParameterSlot> {
        let pos = self.position(side, index).ok()?;
        self.slots(side).get(pos)
    }

    /// Append a slot with an invented name. Returns its host-visible index.
    pub fn add_slot(&mut self, side: Side) -> usize {
        let pos = self.slots(side).len();
        self.place_slot(side, pos);
        self.slot_count(side) - 1
    }

    /// Insert a slot with an invented name at host-visible `index`.
    pub fn insert_slot(&mut self, side: Side, index: usize) -> Result<SchemaChange, SchemaError> {
        if side == Side::Output && self.output_channel && index == 0 {
            return Err(SchemaError::ReservedSlot);
        }
        let offset = self.channel_offset(side);
        let pos = index.saturating_sub(offset);
        if pos > self.slots(side).len() {
            return Err(SchemaError::NoSuchSlot { side, index });
        }
        Ok(self.place_slot(side, pos))
    }

    /// Insert an invented slot at `pos` within the user slots of `side`.
    /// `pos` must not exceed the current user slot count.
    fn place_slot(&mut self, side: Side, pos: usize) -> SchemaChange {
        let name = self.invent_name(side);
        let mut slot = ParameterSlot::new(name).optional(true);
        slot.description = match side {
            Side::Input => "Input script variable".into(),
            Side::Output => "Output script variable".into(),
        };
        let index = pos + self.channel_offset(side);
        tracing::debug!(%side, index, name = %slot.variable_name, "Slot added");
        self.slots_mut(side).insert(pos, slot);
        self.bump(SchemaChange::ALL)
    }

    /// Remove the slot at host-visible `index`.
    ///
    /// The output channel cannot be removed this way; use
    /// [`set_output_channel`](Self::set_output_channel).
    pub fn remove_slot(&mut self, side: Side, index: usize) -> Result<ParameterSlot, SchemaError> {
        let pos = self.position(side, index)?;
        let removed = self.slots_mut(side).remove(pos);
        tracing::debug!(%side, index, name = %removed.variable_name, "Slot removed");
        self.bump(SchemaChange::ALL);
        Ok(removed)
    }

    pub fn rename(
        &mut self,
        side: Side,
        index: usize,
        name: impl Into<String>,
    ) -> Result<SchemaChange, SchemaError> {
        let name = name.into();
        self.edit(side, index, SchemaChange::ALL, |slot| {
            if slot.variable_name == name {
                return false;
            }
            slot.variable_name = name;
            true
        })
    }

    pub fn set_display_name(
        &mut self,
        side: Side,
        index: usize,
        display_name: Option<String>,
    ) -> Result<SchemaChange, SchemaError> {
        let change = SchemaChange {
            declarations: true,
            bindings: false,
        };
        self.edit(side, index, change, |slot| {
            if slot.display_name == display_name {
                return false;
            }
            slot.display_name = display_name;
            true
        })
    }

    pub fn set_description(
        &mut self,
        side: Side,
        index: usize,
        description: impl Into<String>,
    ) -> Result<SchemaChange, SchemaError> {
        let description = description.into();
        let change = SchemaChange {
            declarations: true,
            bindings: false,
        };
        self.edit(side, index, change, |slot| {
            if slot.description == description {
                return false;
            }
            slot.description = description;
            true
        })
    }

    pub fn set_access(
        &mut self,
        side: Side,
        index: usize,
        access: Access,
    ) -> Result<SchemaChange, SchemaError> {
        self.edit(side, index, SchemaChange::ALL, |slot| {
            if slot.access == access {
                return false;
            }
            slot.access = access;
            true
        })
    }

    pub fn set_optional(
        &mut self,
        side: Side,
        index: usize,
        optional: bool,
    ) -> Result<SchemaChange, SchemaError> {
        self.edit(side, index, SchemaChange::ALL, |slot| {
            if slot.optional == optional {
                return false;
            }
            slot.optional = optional;
            true
        })
    }

    pub fn set_type_hint(
        &mut self,
        side: Side,
        index: usize,
        hint: TypeHint,
    ) -> Result<SchemaChange, SchemaError> {
        self.edit(side, index, SchemaChange::ALL, |slot| {
            if slot.type_hint == hint {
                return false;
            }
            slot.type_hint = hint;
            true
        })
    }

    /// Toggle the implicit output channel at output index 0.
    pub fn set_output_channel(&mut self, enabled: bool) -> SchemaChange {
        if self.output_channel == enabled {
            return SchemaChange::NONE;
        }
        self.output_channel = enabled;
        tracing::debug!(enabled, "Output channel toggled");
        self.bump(SchemaChange {
            declarations: false,
            bindings: true,
        })
    }

    /// Check every variable name, inputs first, in slot order.
    ///
    /// Reports the first violation found.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for side in [Side::Input, Side::Output] {
            let offset = self.channel_offset(side);
            let mut seen: HashMap<&str, usize> = HashMap::new();
            for (pos, slot) in self.slots(side).iter().enumerate() {
                let index = pos + offset;
                check_name(side, index, &slot.variable_name)?;
                if let Some(&first) = seen.get(slot.variable_name.as_str()) {
                    return Err(SchemaError::DuplicateName {
                        side,
                        index,
                        first,
                        name: slot.variable_name.clone(),
                    });
                }
                seen.insert(&slot.variable_name, index);
            }
        }
        Ok(())
    }

    fn edit(
        &mut self,
        side: Side,
        index: usize,
        change: SchemaChange,
        apply: impl FnOnce(&mut ParameterSlot) -> bool,
    ) -> Result<SchemaChange, SchemaError> {
        let pos = self.position(side, index)?;
        if apply(&mut self.slots_mut(side)[pos]) {
            Ok(self.bump(change))
        } else {
            Ok(SchemaChange::NONE)
        }
    }

    fn bump(&mut self, change: SchemaChange) -> SchemaChange {
        self.revision += 1;
        change
    }

    fn position(&self, side: Side, index: usize) -> Result<usize, SchemaError> {
        let offset = self.channel_offset(side);
        if index < offset {
            return Err(SchemaError::ReservedSlot);
        }
        let pos = index - offset;
        if pos >= self.slots(side).len() {
            return Err(SchemaError::NoSuchSlot { side, index });
        }
        Ok(pos)
    }

    fn channel_offset(&self, side: Side) -> usize {
        usize::from(side == Side::Output && self.output_channel)
    }

    fn slots(&self, side: Side) -> &Vec<ParameterSlot> {
        match side {
            Side::Input => &self.inputs,
            Side::Output => &self.outputs,
        }
    }

    fn slots_mut(&mut self, side: Side) -> &mut Vec<ParameterSlot> {
        match side {
            Side::Input => &mut self.inputs,
            Side::Output => &mut self.outputs,
        }
    }

    fn invent_name(&self, side: Side) -> String {
        let taken = |name: &str| self.slots(side).iter().any(|s| s.variable_name == name);
        let pool = match side {
            Side::Input => INPUT_NAME_POOL,
            Side::Output => OUTPUT_NAME_POOL,
        };
        for c in pool.chars() {
            let name = c.to_string();
            if !taken(&name) {
                return name;
            }
        }
        (1..)
            .flat_map(|n| pool.chars().map(move |c| format!("{c}{n}")))
            .find(|name| !taken(name))
            .unwrap_or_default()
    }
}

/// Identifier legality and reserved-word check for one variable name.
pub fn check_name(side: Side, index: usize, name: &str) -> Result<(), SchemaError> {
    if name.is_empty() {
        return Err(SchemaError::EmptyName { side, index });
    }
    if !IDENTIFIER.is_match(name) {
        return Err(SchemaError::IllegalName {
            side,
            index,
            name: name.to_string(),
        });
    }
    if RESERVED_WORDS.contains(&name) {
        return Err(SchemaError::ReservedName {
            side,
            index,
            name: name.to_string(),
        });
    }
    Ok(())
}
