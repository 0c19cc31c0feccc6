/// Source extent of a token or AST node. Lines and columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Span {
    pub start_line: usize,
    pub start_col: usize,
    pub end_line: usize,
    pub end_col: usize,
}

impl Span {
    pub fn new(start_line: usize, start_col: usize, end_line: usize, end_col: usize) -> Self {
        Self {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }

    pub fn point(line: usize, col: usize) -> Self {
        Self {
            start_line: line,
            start_col: col,
            end_line: line,
            end_col: col,
        }
    }

    /// Smallest span covering both `self` and `other`.
    pub fn join(self, other: Span) -> Span {
        let (start_line, start_col) =
            if (self.start_line, self.start_col) <= (other.start_line, other.start_col) {
                (self.start_line, self.start_col)
            } else {
                (other.start_line, other.start_col)
            };
        let (end_line, end_col) = if (self.end_line, self.end_col) >= (other.end_line, other.end_col)
        {
            (self.end_line, self.end_col)
        } else {
            (other.end_line, other.end_col)
        };
        Span {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BinaryOp {
    Or,
    And,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Is,
    In,
    NotIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    /// Integer literal; the lexeme is kept as written and converted by the
    /// compiler (arbitrary precision).
    Int {
        text: String,
        span: Span,
    },
    /// Decimal literal `whole.frac`, denoting the exact rational
    /// (whole*10^k + frac) / 10^k.
    Rational {
        whole: String,
        frac: String,
        span: Span,
    },
    Str {
        value: String,
        span: Span,
    },
    Bool {
        value: bool,
        span: Span,
    },
    Nil {
        span: Span,
    },
    Ident(Ident),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        span: Span,
    },
    GetAttr {
        object: Box<Expr>,
        name: Ident,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },
    List {
        items: Vec<Expr>,
        span: Span,
    },
    Dict {
        entries: Vec<DictEntry>,
        span: Span,
    },
    Lambda {
        params: Vec<Ident>,
        body: Vec<Stmt>,
        span: Span,
    },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DictEntry {
    pub key: String,
    pub key_span: Span,
    pub value: Expr,
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Int { span, .. }
            | Expr::Rational { span, .. }
            | Expr::Str { span, .. }
            | Expr::Bool { span, .. }
            | Expr::Nil { span }
            | Expr::Unary { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Call { span, .. }
            | Expr::Index { span, .. }
            | Expr::List { span, .. }
            | Expr::Dict { span, .. }
            | Expr::Lambda { span, .. } => *span,
            Expr::Ident(ident) => ident.span,
            Expr::GetAttr { object, name } => object.span().join(name.span),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Stmt {
    VarDecl {
        name: Ident,
        value: Expr,
    },
    Assign {
        name: Ident,
        value: Expr,
    },
    AssignAttr {
        object: Expr,
        name: Ident,
        value: Expr,
    },
    AssignIndex {
        object: Expr,
        index: Expr,
        value: Expr,
    },
    Expr {
        expr: Expr,
    },
    If {
        condition: Expr,
        then_block: Vec<Stmt>,
        else_block: Option<Vec<Stmt>>,
        span: Span,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    Break {
        span: Span,
    },
    Continue {
        span: Span,
    },
    Return {
        value: Option<Expr>,
        span: Span,
    },
    Import {
        name: Ident,
        span: Span,
    },
    FuncDef {
        name: Ident,
        params: Vec<Ident>,
        body: Vec<Stmt>,
        span: Span,
    },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::VarDecl { name, value } => name.span.join(value.span()),
            Stmt::Assign { name, value } => name.span.join(value.span()),
            Stmt::AssignAttr { object, value, .. } => object.span().join(value.span()),
            Stmt::AssignIndex { object, value, .. } => object.span().join(value.span()),
            Stmt::Expr { expr } => expr.span(),
            Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::Break { span }
            | Stmt::Continue { span }
            | Stmt::Return { span, .. }
            | Stmt::Import { span, .. }
            | Stmt::FuncDef { span, .. } => *span,
        }
    }
}

/// Top-level compilation unit. The module frame executing its statements is
/// the bottom of the VM call stack.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Module {
    pub stmts: Vec<Stmt>,
    pub source_path: Option<String>,
}

/// Metadata for a builtin registered at VM construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinMeta {
    pub name: &'static str,
    /// `None` means variadic.
    pub arity: Option<usize>,
}

const BUILTINS: &[BuiltinMeta] = &[
    BuiltinMeta {
        name: "print",
        arity: None,
    },
    BuiltinMeta {
        name: "input",
        arity: Some(1),
    },
    BuiltinMeta {
        name: "isinstance",
        arity: Some(2),
    },
];

/// Single source of truth for the builtin surface; the VM registers exactly
/// this set and tooling can validate call sites against it.
pub fn lookup_builtin(name: &str) -> Option<BuiltinMeta> {
    BUILTINS.iter().copied().find(|meta| meta.name == name)
}

pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTINS.iter().map(|meta| meta.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_join_covers_both_extents() {
        let a = Span::new(1, 4, 1, 9);
        let b = Span::new(2, 1, 3, 2);
        let joined = a.join(b);
        assert_eq!(joined, Span::new(1, 4, 3, 2));
        assert_eq!(b.join(a), joined);
    }

    #[test]
    fn builtin_registry_knows_the_core_set() {
        assert_eq!(lookup_builtin("print").unwrap().arity, None);
        assert_eq!(lookup_builtin("input").unwrap().arity, Some(1));
        assert_eq!(lookup_builtin("isinstance").unwrap().arity, Some(2));
        assert!(lookup_builtin("println").is_none());
    }

    #[test]
    fn expr_span_of_attribute_access_spans_object_and_name() {
        let expr = Expr::GetAttr {
            object: Box::new(Expr::Ident(Ident {
                name: "dict".to_string(),
                span: Span::new(4, 1, 4, 4),
            })),
            name: Ident {
                name: "key".to_string(),
                span: Span::new(4, 6, 4, 8),
            },
        };
        assert_eq!(expr.span(), Span::new(4, 1, 4, 8));
    }
}
