//! Abstract relational expressions.
//!
//! The optimizer never renders SQL; annotations and window bounds are
//! communicated to the engine as small expression trees. Engines translate
//! them into their own dialect, and the pagination planner folds trivial
//! arithmetic so the emitted forms stay readable.

/// An abstract expression the engine can compute per row or per partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Integer literal.
    Value(i64),
    /// Reference to a projected column or annotation alias.
    Column(String),
    /// Correlated count of the rows in the current prefetch partition.
    PartitionCount,
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    /// `CASE WHEN cond THEN then ELSE default END`.
    Case {
        when: Cond,
        then: Box<Expr>,
        default: Box<Expr>,
    },
    /// Host-supplied expression carried as an opaque token. The token is
    /// what plan fingerprints hash.
    Raw(String),
}

/// Conditions usable inside [`Expr::Case`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cond {
    Lt(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn value(value: u64) -> Expr {
        Expr::Value(value as i64)
    }

    /// `left + right`, folding out a zero on either side.
    pub fn add(left: Expr, right: Expr) -> Expr {
        match (left, right) {
            (Expr::Value(0), right) => right,
            (left, Expr::Value(0)) => left,
            (left, right) => Expr::Add(Box::new(left), Box::new(right)),
        }
    }

    /// `left - right`, folding out a zero subtrahend.
    pub fn sub(left: Expr, right: Expr) -> Expr {
        match (left, right) {
            (left, Expr::Value(0)) => left,
            (left, right) => Expr::Sub(Box::new(left), Box::new(right)),
        }
    }

    pub fn case(when: Cond, then: Expr, default: Expr) -> Expr {
        Expr::Case {
            when,
            then: Box::new(then),
            default: Box::new(default),
        }
    }

    /// Evaluate against a known partition size. Returns `None` for
    /// expressions referencing data the caller does not have (columns, raw
    /// host expressions).
    pub fn evaluate(&self, partition_size: i64) -> Option<i64> {
        match self {
            Expr::Value(value) => Some(*value),
            Expr::PartitionCount => Some(partition_size),
            Expr::Add(left, right) => {
                Some(left.evaluate(partition_size)? + right.evaluate(partition_size)?)
            }
            Expr::Sub(left, right) => {
                Some(left.evaluate(partition_size)? - right.evaluate(partition_size)?)
            }
            Expr::Case {
                when,
                then,
                default,
            } => {
                let Cond::Lt(lhs, rhs) = when;
                if lhs.evaluate(partition_size)? < rhs.evaluate(partition_size)? {
                    then.evaluate(partition_size)
                } else {
                    default.evaluate(partition_size)
                }
            }
            Expr::Column(_) | Expr::Raw(_) => None,
        }
    }

    /// Canonical token for plan fingerprinting. Structurally identical
    /// expressions produce identical tokens.
    pub fn fingerprint_token(&self) -> String {
        match self {
            Expr::Value(value) => format!("v{value}"),
            Expr::Column(name) => format!("col({name})"),
            Expr::PartitionCount => "pcount".to_string(),
            Expr::Add(left, right) => {
                format!("add({},{})", left.fingerprint_token(), right.fingerprint_token())
            }
            Expr::Sub(left, right) => {
                format!("sub({},{})", left.fingerprint_token(), right.fingerprint_token())
            }
            Expr::Case {
                when: Cond::Lt(lhs, rhs),
                then,
                default,
            } => format!(
                "case(lt({},{}),{},{})",
                lhs.fingerprint_token(),
                rhs.fingerprint_token(),
                then.fingerprint_token(),
                default.fingerprint_token()
            ),
            Expr::Raw(token) => format!("raw({token})"),
        }
    }
}

impl Cond {
    pub fn lt(left: Expr, right: Expr) -> Cond {
        Cond::Lt(Box::new(left), Box::new(right))
    }
}

/// Per-partition row-number window attached to a prefetch queryset.
///
/// Engines number rows within each partition (1-based, in `order_by` order)
/// and keep those with `start < row_number <= stop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionWindow {
    /// Partition column; for many-to-many prefetches this is qualified with
    /// the join table (`"<table>.<column>"`).
    pub partition_by: String,
    pub order_by: Vec<String>,
    pub start: Expr,
    pub stop: Expr,
}
