#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// `$fields` projection hint: an include-set or an exclude-set, never
/// both.
#[derive(Debug, Clone)]
pub struct FieldsSpec {
    pub include: bool,
    pub paths: Vec<String>,
}

/// Execution hints: `$orderby`, `$skip`, `$max`, `$min`, `$fields`.
#[derive(Debug, Clone, Default)]
pub struct Hints {
    pub order_by: Vec<(String, SortDir)>,
    pub skip: usize,
    pub max: Option<usize>,
    /// Expected result floor; used only to presize buffers.
    pub min: Option<usize>,
    pub fields: Option<FieldsSpec>,
}
