use satchel_document::Document;

/// Update operators, applied left-to-right before the modified
/// document is re-stored.
#[derive(Debug, Clone)]
pub enum UpdateOp {
    /// `{path: value}` assignments; paths may be dotted and may carry
    /// positional `$` segments.
    Set(Document),
    Unset(Vec<String>),
    Inc(Document),
    /// `{old_path: "new_name"}` pairs.
    Rename(Vec<(String, String)>),
    AddToSet(Document),
    AddToSetAll(Document),
    Push(Document),
    PushAll(Document),
    Pull(Document),
    PullAll(Document),
    /// Set-or-insert: when the query matched nothing, the operand
    /// document is stored as a new record.
    Upsert(Document),
    Do(Vec<DoAction>),
    /// Remove matched documents entirely.
    DropAll,
}

impl UpdateOp {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateOp::Set(_) => "$set",
            UpdateOp::Unset(_) => "$unset",
            UpdateOp::Inc(_) => "$inc",
            UpdateOp::Rename(_) => "$rename",
            UpdateOp::AddToSet(_) => "$addToSet",
            UpdateOp::AddToSetAll(_) => "$addToSetAll",
            UpdateOp::Push(_) => "$push",
            UpdateOp::PushAll(_) => "$pushAll",
            UpdateOp::Pull(_) => "$pull",
            UpdateOp::PullAll(_) => "$pullAll",
            UpdateOp::Upsert(_) => "$upsert",
            UpdateOp::Do(_) => "$do",
            UpdateOp::DropAll => "$dropall",
        }
    }
}

/// `$do` result-construction actions.
#[derive(Debug, Clone)]
pub enum DoAction {
    /// Replace OIDs at `path` with the referenced documents from
    /// another collection.
    Join { path: String, collection: String },
    /// Trim the array at `path` to `[skip, skip + limit)`.
    Slice { path: String, skip: i64, limit: i64 },
}
