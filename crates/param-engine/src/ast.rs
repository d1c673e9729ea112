#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

/// A parsed formula expression.
///
/// The grammar is deliberately small: arithmetic over numbers and named
/// symbols, plus calls to the fixed builtin function table. Everything a
/// formula can reference by name appears as [`Expr::Ident`] or as a call
/// target, which is what the free-variable analyzer walks.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Number(f64),
    Ident(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Visit every name the expression mentions, including call targets.
    pub fn for_each_name<F: FnMut(&str)>(&self, f: &mut F) {
        match self {
            Expr::Number(_) => {}
            Expr::Ident(name) => f(name),
            Expr::Unary { expr, .. } => expr.for_each_name(f),
            Expr::Binary { left, right, .. } => {
                left.for_each_name(f);
                right.for_each_name(f);
            }
            Expr::Call { name, args } => {
                f(name);
                for arg in args {
                    arg.for_each_name(f);
                }
            }
        }
    }
}
