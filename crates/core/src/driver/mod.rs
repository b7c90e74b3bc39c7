//! Batch execution: runs every statement of one submission, then starts the
//! final value of each assigned name.

use std::{fmt, future::Future, rc::Rc};

use crate::{binding::validate_name, BindingValue, Context, Result, Runtime};

/// Right-hand side of a statement, evaluated against the live context.
pub type Expr = Box<dyn FnOnce(&Context) -> Result<BindingValue>>;

pub enum Statement {
    Assign { name: String, expr: Expr },
    /// Evaluated for its side effects; the value is not bound or started.
    Eval(Expr),
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Assign { name, .. } => f.debug_struct("Assign").field("name", name).finish(),
            Statement::Eval(_) => f.write_str("Eval"),
        }
    }
}

/// Ordered statements of one execution.
#[derive(Debug, Default)]
pub struct Batch {
    statements: Vec<Statement>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign<F>(mut self, name: impl Into<String>, expr: F) -> Self
    where
        F: FnOnce(&Context) -> Result<BindingValue> + 'static,
    {
        self.statements.push(Statement::Assign {
            name: name.into(),
            expr: Box::new(expr),
        });
        self
    }

    pub fn eval<F>(mut self, expr: F) -> Self
    where
        F: FnOnce(&Context) -> Result<BindingValue> + 'static,
    {
        self.statements.push(Statement::Eval(Box::new(expr)));
        self
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// What one [`Runtime::execute`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Names started, in first-assignment order.
    pub started: Vec<String>,
    /// Assignments overwritten later in the same batch.
    pub collapsed: usize,
    pub evaluated: usize,
}

impl Runtime {
    /// Runs `batch` against the live context.
    ///
    /// Every right-hand side is evaluated in order and bound as it goes; a
    /// failing expression aborts the batch before anything is started. Then
    /// each assigned name is started once with its last value, in the order
    /// names were first assigned. Every start is attempted; the first error
    /// is returned after the others have run.
    pub fn execute(&self, batch: Batch) -> impl Future<Output = Result<ExecutionReport>> + 'static {
        let this = self.clone();

        async move {
            let mut report = ExecutionReport::default();
            let mut order: Vec<String> = Vec::new();

            for statement in batch.statements {
                match statement {
                    Statement::Assign { name, expr } => {
                        validate_name(&name)?;
                        let value = {
                            let context = this.context().borrow();
                            expr(&*context)?
                        };
                        let kept = value.clone();
                        let previous = this.context().borrow_mut().bind(name.clone(), value);

                        if order.contains(&name) {
                            report.collapsed += 1;
                            if let Some(previous) = previous {
                                this.retire_collapsed(&name, &previous, &kept);
                            }
                        } else {
                            order.push(name);
                        }
                    }
                    Statement::Eval(expr) => {
                        let context = this.context().borrow();
                        expr(&*context)?;
                        report.evaluated += 1;
                    }
                }
            }

            let mut first_error = None;
            for name in order {
                match this.start(name.clone()).await {
                    Ok(()) => report.started.push(name),
                    Err(err) => {
                        tracing::warn!(name = %name, %err, "start failed");
                        first_error.get_or_insert(err);
                    }
                }
            }

            tracing::debug!(
                started = report.started.len(),
                collapsed = report.collapsed,
                evaluated = report.evaluated,
                "batch executed"
            );
            match first_error {
                Some(err) => Err(err),
                None => Ok(report),
            }
        }
    }

    /// Releases resources of a value that was overwritten before it was ever
    /// started. Streams of such a value never ran, so they hold nothing.
    fn retire_collapsed(&self, name: &str, previous: &BindingValue, replacement: &BindingValue) {
        if !self.config().dispose_collapsed {
            return;
        }

        let separator = self.config().group_separator;
        let keep = replacement.resource_members(name, separator);
        for (id, resource) in previous.resource_members(name, separator) {
            let reused = keep.iter().any(|(_, kept)| Rc::ptr_eq(kept, &resource));
            if reused || self.resources().holds(&resource) {
                continue;
            }
            tracing::debug!(id = %id, kind = resource.kind(), "disposing collapsed resource");
            resource.dispose();
        }
    }
}
