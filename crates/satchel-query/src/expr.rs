use satchel_document::Value;

/// Predicate tree over a candidate document.
#[derive(Debug, Clone)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Leaf(Condition),
    /// At least one element of the array at `path` satisfies every
    /// condition in the group; the index of the first such element is
    /// bound to the query's positional `$` slot for `path`.
    ElemMatch {
        path: String,
        group: u32,
        conditions: Vec<Condition>,
    },
}

impl Predicate {
    /// An empty conjunction matches every document.
    pub fn always() -> Predicate {
        Predicate::And(Vec::new())
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Predicate::And(children) if children.is_empty())
    }
}

/// One field condition. `path` is relative to the array element when
/// the condition belongs to an `$elemMatch` group.
#[derive(Debug, Clone)]
pub struct Condition {
    pub path: String,
    pub op: ConditionOp,
    /// `$not` wrapper.
    pub negate: bool,
    /// `$icase` wrapper: string comparisons case-fold first.
    pub icase: bool,
}

#[derive(Debug, Clone)]
pub enum ConditionOp {
    Eq(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    /// String prefix.
    Begin(String),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    /// Numeric closed interval.
    Between(Value, Value),
    /// All tokens present in a tokenizable field.
    StrAnd(Vec<String>),
    /// Any token present.
    StrOr(Vec<String>),
    Exists(bool),
    /// A regex literal in value position.
    Matches(regex::Regex),
}

impl ConditionOp {
    pub fn name(&self) -> &'static str {
        match self {
            ConditionOp::Eq(_) => "$eq",
            ConditionOp::Gt(_) => "$gt",
            ConditionOp::Gte(_) => "$gte",
            ConditionOp::Lt(_) => "$lt",
            ConditionOp::Lte(_) => "$lte",
            ConditionOp::Begin(_) => "$begin",
            ConditionOp::In(_) => "$in",
            ConditionOp::NotIn(_) => "$nin",
            ConditionOp::Between(..) => "$bt",
            ConditionOp::StrAnd(_) => "$strand",
            ConditionOp::StrOr(_) => "$stror",
            ConditionOp::Exists(_) => "$exists",
            ConditionOp::Matches(_) => "regex",
        }
    }
}
