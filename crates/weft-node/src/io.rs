//! Moving slot data between the host graph and a script call.

use std::collections::BTreeMap;

use weft_core::{
    Access, DataTree, ForeignBridge, HostValue, Level, MarshalError, NodeMessage, ParameterSchema,
    ParameterSlot, RuntimeValue, Side, TreePath, from_runtime_value, to_runtime_value,
};

/// What one output slot receives.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotData {
    Item(HostValue),
    List(Vec<HostValue>),
    Tree(DataTree),
}

impl SlotData {
    pub fn into_host_value(self) -> HostValue {
        match self {
            SlotData::Item(value) => value,
            SlotData::List(items) => HostValue::List(items),
            SlotData::Tree(tree) => HostValue::Tree(tree),
        }
    }
}

/// The host's view of one solve: data wired into inputs, and a place to put
/// outputs. Indices are host-visible slot indices.
pub trait DataAccess {
    /// Data connected to input `index`, or `None` when nothing is wired in.
    fn input(&self, index: usize) -> Option<&DataTree>;

    fn set_output(&mut self, index: usize, data: SlotData);
}

/// In-memory [`DataAccess`] for tests and the command line.
#[derive(Debug, Default, Clone)]
pub struct SolveData {
    inputs: BTreeMap<usize, DataTree>,
    outputs: BTreeMap<usize, SlotData>,
}

impl SolveData {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single item on branch `{0}`.
    pub fn with_item(self, index: usize, value: impl Into<HostValue>) -> Self {
        self.with_list(index, vec![value.into()])
    }

    /// Items on branch `{0}`.
    pub fn with_list(mut self, index: usize, items: Vec<HostValue>) -> Self {
        let mut tree = DataTree::new();
        tree.insert_branch(TreePath::new([0]), items);
        self.inputs.insert(index, tree);
        self
    }

    pub fn with_tree(mut self, index: usize, tree: DataTree) -> Self {
        self.inputs.insert(index, tree);
        self
    }

    pub fn output(&self, index: usize) -> Option<&SlotData> {
        self.outputs.get(&index)
    }

    pub fn outputs(&self) -> &BTreeMap<usize, SlotData> {
        &self.outputs
    }
}

impl DataAccess for SolveData {
    fn input(&self, index: usize) -> Option<&DataTree> {
        self.inputs.get(&index)
    }

    fn set_output(&mut self, index: usize, data: SlotData) {
        self.outputs.insert(index, data);
    }
}

/// Why inputs could not be turned into a script argument.
#[derive(Debug)]
pub enum CollectError {
    /// A required input had no data. Solving is skipped, not failed.
    Missing(NodeMessage),
    Marshal(NodeMessage),
}

/// Build the `inputs` object for the entry function.
pub fn collect_inputs(
    schema: &ParameterSchema,
    data: &dyn DataAccess,
    bridge: &mut dyn ForeignBridge,
) -> Result<RuntimeValue, CollectError> {
    let mut inputs = BTreeMap::new();
    for (index, slot) in schema.inputs().iter().enumerate() {
        let tree = data.input(index).filter(|tree| tree.item_count() > 0);
        let host = match (tree, slot.access) {
            (None, _) if !slot.optional => {
                return Err(CollectError::Missing(
                    NodeMessage::new(
                        Level::Warning,
                        format!("Input parameter {} failed to collect data", slot.display_name()),
                    )
                    .at(Side::Input, index),
                ));
            }
            (None, Access::Item) => HostValue::Null,
            (None, Access::List) => HostValue::List(Vec::new()),
            (None, Access::Tree) => HostValue::Tree(DataTree::new()),
            (Some(tree), Access::Item) => first_item(tree),
            (Some(tree), Access::List) => HostValue::List(flatten(tree)),
            (Some(tree), Access::Tree) => HostValue::Tree(tree.clone()),
        };
        let value = to_runtime_value(&host, &slot.type_hint, bridge)
            .map_err(|e| CollectError::Marshal(marshal_message(Side::Input, index, slot, &e)))?;
        inputs.insert(slot.variable_name.clone(), value);
    }
    Ok(RuntimeValue::Object(inputs))
}

fn first_item(tree: &DataTree) -> HostValue {
    tree.branches()
        .flat_map(|(_, items)| items.iter())
        .next()
        .cloned()
        .unwrap_or(HostValue::Null)
}

fn flatten(tree: &DataTree) -> Vec<HostValue> {
    tree.branches()
        .flat_map(|(_, items)| items.iter().cloned())
        .collect()
}

/// Write the entry function's result to the output slots.
///
/// Keys are matched to variable names exactly. A missing key leaves an item
/// slot untouched and gives list and tree slots an empty value.
pub fn apply_outputs(
    schema: &ParameterSchema,
    result: &RuntimeValue,
    bridge: &dyn ForeignBridge,
    data: &mut dyn DataAccess,
) -> Vec<NodeMessage> {
    let mut messages = Vec::new();
    if schema.outputs().is_empty() {
        return messages;
    }
    let Some(fields) = result.as_object() else {
        messages.push(NodeMessage::new(
            Level::Error,
            format!(
                "runScript must return an object keyed by output name, got {}",
                result.type_name()
            ),
        ));
        return messages;
    };

    for (position, slot) in schema.outputs().iter().enumerate() {
        let index = schema.output_index(position);
        let value = match fields.get(&slot.variable_name) {
            Some(value) => match from_runtime_value(value, bridge) {
                Ok(value) => value,
                Err(e) => {
                    messages.push(marshal_message(Side::Output, index, slot, &e));
                    continue;
                }
            },
            None => None,
        };
        let shaped = match (slot.access, value) {
            (Access::Item, None) => continue,
            (Access::Item, Some(value)) => SlotData::Item(value),
            (Access::List, None) => SlotData::List(Vec::new()),
            (Access::List, Some(HostValue::List(items))) => SlotData::List(items),
            (Access::List, Some(HostValue::Tree(tree))) => SlotData::List(flatten(&tree)),
            (Access::List, Some(value)) => SlotData::List(vec![value]),
            (Access::Tree, None) => SlotData::Tree(DataTree::new()),
            (Access::Tree, Some(HostValue::Tree(tree))) => SlotData::Tree(tree),
            (Access::Tree, Some(HostValue::List(items))) => {
                SlotData::Tree(DataTree::from_iter([(TreePath::new([0]), items)]))
            }
            (Access::Tree, Some(value)) => {
                SlotData::Tree(DataTree::from_iter([(TreePath::new([0]), vec![value])]))
            }
        };
        data.set_output(index, shaped);
    }
    messages
}

fn marshal_message(side: Side, index: usize, slot: &ParameterSlot, err: &MarshalError) -> NodeMessage {
    NodeMessage::new(Level::Error, format!("{}: {err}", slot.display_name())).at(side, index)
}

/// Host value from JSON. Integral numbers stay integers.
pub fn host_value_from_json(value: &serde_json::Value) -> HostValue {
    use serde_json::Value;
    match value {
        Value::Null => HostValue::Null,
        Value::Bool(b) => HostValue::Bool(*b),
        Value::Number(n) => n
            .as_i64()
            .map(HostValue::Int)
            .or_else(|| n.as_u64().map(HostValue::UInt))
            .unwrap_or_else(|| HostValue::Float(n.as_f64().unwrap_or(f64::NAN))),
        Value::String(s) => HostValue::Text(s.clone()),
        Value::Array(items) => HostValue::List(items.iter().map(host_value_from_json).collect()),
        Value::Object(fields) => HostValue::Record(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), host_value_from_json(v)))
                .collect(),
        ),
    }
}

/// JSON rendering of a host value. Trees become `{"{0;1}": [...]}` maps and
/// foreign objects their type name.
pub fn host_value_to_json(value: &HostValue) -> serde_json::Value {
    use serde_json::{Value, json};
    match value {
        HostValue::Null => Value::Null,
        HostValue::Bool(b) => json!(b),
        HostValue::Int(i) => json!(i),
        HostValue::UInt(u) => json!(u),
        HostValue::Float(f) => json!(f),
        HostValue::Char(c) => json!(c.to_string()),
        HostValue::Text(s) => json!(s),
        HostValue::List(items) => Value::Array(items.iter().map(host_value_to_json).collect()),
        HostValue::Tree(tree) => Value::Object(
            tree.branches()
                .map(|(path, items)| {
                    (
                        path.to_string(),
                        Value::Array(items.iter().map(host_value_to_json).collect()),
                    )
                })
                .collect(),
        ),
        HostValue::Record(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), host_value_to_json(v)))
                .collect(),
        ),
        HostValue::Object(object) => json!(format!("<{}>", object.short_type_name())),
    }
}
