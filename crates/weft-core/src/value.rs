use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A value as the host graph sees it.
///
/// Equality is by value: `Int`, `UInt` and `Float` are equal when they
/// denote the same number, and a `Char` equals the one-character `Text`.
/// Scripts see a single number and string type, so these are the
/// distinctions a round trip through the runtime cannot keep.
#[derive(Debug, Clone)]
pub enum HostValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Char(char),
    Text(String),
    List(Vec<HostValue>),
    Tree(DataTree),
    Record(BTreeMap<String, HostValue>),
    Object(ForeignObject),
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        use HostValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (UInt(a), UInt(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(i), UInt(u)) | (UInt(u), Int(i)) => u64::try_from(*i).is_ok_and(|i| i == *u),
            (Int(i), Float(f)) | (Float(f), Int(i)) => float_is_integer(*f, *i as i128),
            (UInt(u), Float(f)) | (Float(f), UInt(u)) => float_is_integer(*f, *u as i128),
            (Char(a), Char(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Char(c), Text(t)) | (Text(t), Char(c)) => {
                let mut chars = t.chars();
                chars.next() == Some(*c) && chars.next().is_none()
            }
            (List(a), List(b)) => a == b,
            (Tree(a), Tree(b)) => a == b,
            (Record(a), Record(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            _ => false,
        }
    }
}

/// Exact comparison of a float with an integer, without rounding the integer.
fn float_is_integer(f: f64, n: i128) -> bool {
    // Every finite f64 in this range is exactly representable as i128.
    f.is_finite() && f.fract() == 0.0 && f.abs() < 1.7e38 && f as i128 == n
}

impl HostValue {
    /// Short type name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            HostValue::Null => "null",
            HostValue::Bool(_) => "bool",
            HostValue::Int(_) => "int",
            HostValue::UInt(_) => "uint",
            HostValue::Float(_) => "float",
            HostValue::Char(_) => "char",
            HostValue::Text(_) => "text",
            HostValue::List(_) => "list",
            HostValue::Tree(_) => "tree",
            HostValue::Record(_) => "record",
            HostValue::Object(_) => "object",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Int(i) => Some(*i as f64),
            HostValue::UInt(u) => Some(*u as f64),
            HostValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

macro_rules! host_from {
    ($($t:ty => $variant:ident as $cast:ty),* $(,)?) => {
        $(impl From<$t> for HostValue {
            fn from(v: $t) -> Self {
                HostValue::$variant(<$cast>::from(v))
            }
        })*
    };
}

host_from! {
    bool => Bool as bool,
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int as i64,
    u8 => Int as i64,
    u16 => Int as i64,
    u32 => Int as i64,
    u64 => UInt as u64,
    f32 => Float as f64,
    f64 => Float as f64,
    char => Char as char,
    String => Text as String,
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::Text(v.to_string())
    }
}

impl From<DataTree> for HostValue {
    fn from(v: DataTree) -> Self {
        HostValue::Tree(v)
    }
}

impl<T: Into<HostValue>> From<Vec<T>> for HostValue {
    fn from(v: Vec<T>) -> Self {
        HostValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Integer-tuple address of one branch in a [`DataTree`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TreePath(pub Vec<u32>);

impl TreePath {
    pub fn new(indices: impl Into<Vec<u32>>) -> Self {
        Self(indices.into())
    }

    pub fn indices(&self) -> &[u32] {
        &self.0
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, idx) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            write!(f, "{idx}")?;
        }
        write!(f, "}}")
    }
}

/// Sparse hierarchical container: each path owns an ordered list of items.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataTree {
    branches: BTreeMap<TreePath, Vec<HostValue>>,
}

impl DataTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item to the branch at `path`, creating the branch if needed.
    pub fn push(&mut self, path: TreePath, item: HostValue) {
        self.branches.entry(path).or_default().push(item);
    }

    /// Replace the whole branch at `path`.
    pub fn insert_branch(&mut self, path: TreePath, items: Vec<HostValue>) {
        self.branches.insert(path, items);
    }

    pub fn branch(&self, path: &TreePath) -> Option<&[HostValue]> {
        self.branches.get(path).map(Vec::as_slice)
    }

    pub fn branches(&self) -> impl Iterator<Item = (&TreePath, &[HostValue])> {
        self.branches.iter().map(|(p, v)| (p, v.as_slice()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &TreePath> {
        self.branches.keys()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Total number of items across all branches.
    pub fn item_count(&self) -> usize {
        self.branches.values().map(Vec::len).sum()
    }
}

impl FromIterator<(TreePath, Vec<HostValue>)> for DataTree {
    fn from_iter<I: IntoIterator<Item = (TreePath, Vec<HostValue>)>>(iter: I) -> Self {
        Self {
            branches: iter.into_iter().collect(),
        }
    }
}

/// An opaque host object that crosses into the runtime by reference.
///
/// Equality is identity: two `ForeignObject`s are equal when they share the
/// same allocation.
#[derive(Clone)]
pub struct ForeignObject {
    inner: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl ForeignObject {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            inner: value,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully qualified Rust type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Last path segment of the type name, as shown to scripts.
    pub fn short_type_name(&self) -> &'static str {
        display_type_name(self.type_name)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &ForeignObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for ForeignObject {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ForeignObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignObject")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Last path segment of a fully qualified type name, without generics.
pub fn display_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// A value as the script runtime sees it.
///
/// `Unclassified` carries the runtime type name of anything the bridge could
/// not map (functions, symbols, pending promises); converting it back to a
/// host value always fails.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeValue {
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    BigInt(i64),
    String(String),
    /// Milliseconds since the Unix epoch; a `Date` in script.
    Date(f64),
    Array(Vec<RuntimeValue>),
    /// `type_name` is the fully qualified host type name.
    ForeignHandle { id: u64, type_name: String },
    Object(BTreeMap<String, RuntimeValue>),
    Unclassified(String),
}

impl RuntimeValue {
    pub fn type_name(&self) -> &str {
        match self {
            RuntimeValue::Null => "null",
            RuntimeValue::Undefined => "undefined",
            RuntimeValue::Bool(_) => "boolean",
            RuntimeValue::Number(_) => "number",
            RuntimeValue::BigInt(_) => "bigint",
            RuntimeValue::String(_) => "string",
            RuntimeValue::Date(_) => "date",
            RuntimeValue::Array(_) => "array",
            RuntimeValue::ForeignHandle { .. } => "foreign",
            RuntimeValue::Object(_) => "object",
            RuntimeValue::Unclassified(name) => name,
        }
    }

    /// An object built from `(key, value)` pairs.
    pub fn from_pairs<K: Into<String>>(pairs: impl IntoIterator<Item = (K, RuntimeValue)>) -> Self {
        RuntimeValue::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, RuntimeValue>> {
        match self {
            RuntimeValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, RuntimeValue::Null | RuntimeValue::Undefined)
    }
}

impl From<&str> for RuntimeValue {
    fn from(v: &str) -> Self {
        RuntimeValue::String(v.to_string())
    }
}

impl From<f64> for RuntimeValue {
    fn from(v: f64) -> Self {
        RuntimeValue::Number(v)
    }
}

impl From<bool> for RuntimeValue {
    fn from(v: bool) -> Self {
        RuntimeValue::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Mesh {
        vertices: usize,
    }

    #[test]
    fn integer_widths_convert() {
        assert!(matches!(HostValue::from(7u8), HostValue::Int(7)));
        assert!(matches!(HostValue::from(-7i16), HostValue::Int(-7)));
        assert!(matches!(HostValue::from(u32::MAX), HostValue::Int(n) if n == u32::MAX as i64));
        assert!(matches!(HostValue::from(u64::MAX), HostValue::UInt(u64::MAX)));
        assert!(matches!(HostValue::from('q'), HostValue::Char('q')));
    }

    #[test]
    fn equality_is_by_value() {
        assert_eq!(HostValue::Float(2.0), HostValue::Int(2));
        assert_eq!(HostValue::UInt(7), HostValue::Int(7));
        assert_eq!(HostValue::Float(-0.0), HostValue::UInt(0));
        assert_eq!(HostValue::Char('c'), HostValue::Text("c".into()));
        assert_ne!(HostValue::Float(2.5), HostValue::Int(2));
        assert_ne!(HostValue::Int(-1), HostValue::UInt(u64::MAX));
        assert_ne!(HostValue::Float(u64::MAX as f64), HostValue::UInt(u64::MAX));
        assert_ne!(HostValue::Char('c'), HostValue::Text("cc".into()));
        assert_ne!(HostValue::Int(1), HostValue::Bool(true));
        assert_ne!(HostValue::Float(f64::NAN), HostValue::Float(f64::NAN));
        assert_eq!(
            HostValue::List(vec![HostValue::Int(1), HostValue::Char('x')]),
            HostValue::List(vec![HostValue::Float(1.0), HostValue::Text("x".into())])
        );
    }

    #[test]
    fn tree_keeps_branch_order_and_sorting() {
        let mut tree = DataTree::new();
        tree.push(TreePath::new([1]), 3.into());
        tree.push(TreePath::new([0, 2]), "a".into());
        tree.push(TreePath::new([1]), 1.into());

        let paths: Vec<_> = tree.paths().cloned().collect();
        assert_eq!(paths, vec![TreePath::new([0, 2]), TreePath::new([1])]);
        assert_eq!(
            tree.branch(&TreePath::new([1])).unwrap(),
            &[HostValue::Int(3), HostValue::Int(1)]
        );
        assert_eq!(tree.item_count(), 3);
    }

    #[test]
    fn tree_path_display() {
        assert_eq!(TreePath::new([0, 4, 1]).to_string(), "{0;4;1}");
        assert_eq!(TreePath::default().to_string(), "{}");
    }

    #[test]
    fn display_names_drop_paths_and_generics() {
        assert_eq!(display_type_name("geo::mesh::Mesh"), "Mesh");
        assert_eq!(display_type_name("alloc::vec::Vec<geo::Point>"), "Vec");
        assert_eq!(display_type_name("Curve"), "Curve");
    }

    #[test]
    fn foreign_object_identity() {
        let a = ForeignObject::new(Mesh { vertices: 12 });
        let b = a.clone();
        let c = ForeignObject::new(Mesh { vertices: 12 });
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.short_type_name(), "Mesh");
        assert!(a.type_name().ends_with("::Mesh"));
        assert_eq!(a.downcast_ref::<Mesh>().unwrap().vertices, 12);
        assert!(a.downcast_ref::<String>().is_none());
    }
}
