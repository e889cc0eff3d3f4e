//! Translation of views, procedures, functions and triggers to PostgreSQL.
//!
//! A routine's source text is rewritten by an ordered list of
//! [`RewriteRule`](rules::RewriteRule)s specific to the source dialect,
//! checked before it is sent anywhere, and applied in one transaction.
//! Anything that fails along the way is replaced by an inert stub of the
//! same name and kind, so the target schema stays complete and the failure
//! is visible in the catalog.

pub mod lexer;
mod mssql;
mod mysql;
pub mod render;
pub mod rules;
mod stub;
pub mod validate;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::SourceType;
use crate::core::schema::{RoutineDescriptor, RoutineKind, RoutineStatus};
use crate::core::traits::TargetExecutor;
use crate::error::{ErrorKind, MigrateError, Result};
use crate::typemap::{mapper_for, TypeMapper};

pub use mssql::MssqlRoutines;
pub use mysql::MysqlRoutines;
use lexer::{tokenize, TokenKind};
use render::{
    function_statement, trigger_function_name, trigger_return, trigger_statements,
    view_statements, Signature,
};
use rules::{apply_rules, RewriteContext, RewriteRule};
use validate::{check_body, check_view, insert_closers, Verdict};

/// Characters of original source embedded in a stub's comment.
pub const DEFAULT_STUB_COMMENT_LIMIT: usize = 500;

/// A local variable hoisted into the PL/pgSQL `DECLARE` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub name: String,
    /// Target type.
    pub data_type: String,
}

/// Source-dialect knowledge used to rewrite routine text.
pub trait RoutineDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// The routine body (or view query) without its `CREATE` header.
    fn extract_body(&self, routine: &RoutineDescriptor, text: &str) -> Result<String>;

    fn view_rules(&self) -> &'static [RewriteRule];

    /// Rules applied to a routine body before declarations are hoisted.
    fn body_rules(&self) -> &'static [RewriteRule];

    /// Remove variable declarations from `body`, leaving initializers in
    /// place as assignments.
    fn hoist_declarations(&self, body: &str, mapper: &dyn TypeMapper)
        -> (Vec<Declaration>, String);

    /// Rules converting control flow and assignments, run after hoisting.
    fn control_rules(&self) -> &'static [RewriteRule];
}

/// Dialect for a source engine.
pub fn dialect_for(source: SourceType) -> Box<dyn RoutineDialect> {
    match source {
        SourceType::Mssql => Box::new(MssqlRoutines),
        SourceType::Mysql => Box::new(MysqlRoutines),
    }
}

/// Steps of a routine's translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationState {
    Fetched,
    Rewritten,
    Applied,
    RewriteFailed,
    StubApplied,
    StubFailed,
}

/// What happened to one routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslationOutcome {
    /// Source-qualified name.
    pub name: String,
    pub kind: RoutineKind,
    /// Final state.
    pub state: TranslationState,
    /// Every state passed through, in order.
    pub history: Vec<TranslationState>,
    /// `END IF` closers added by the heuristic pass.
    pub closers_inserted: usize,
    /// Category of the failure that sent the routine to the stub path.
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    /// Why the stub could not be applied either.
    pub stub_error: Option<String>,
}

impl TranslationOutcome {
    fn new(routine: &RoutineDescriptor) -> Self {
        Self {
            name: routine.full_name(),
            kind: routine.kind,
            state: TranslationState::Fetched,
            history: vec![TranslationState::Fetched],
            closers_inserted: 0,
            error_kind: None,
            message: None,
            stub_error: None,
        }
    }

    fn advance(&mut self, state: TranslationState) {
        self.state = state;
        self.history.push(state);
    }

    pub fn is_stubbed(&self) -> bool {
        self.state == TranslationState::StubApplied
    }
}

/// Target statements produced by a successful rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub statements: Vec<String>,
    pub closers_inserted: usize,
}

/// Rewrites routines from one source schema and applies them to the target.
pub struct ObjectTranslator<'a> {
    target: &'a dyn TargetExecutor,
    mapper: Arc<dyn TypeMapper>,
    dialect: Box<dyn RoutineDialect>,
    source_schema: String,
    target_schema: String,
    stub_comment_limit: usize,
}

impl<'a> ObjectTranslator<'a> {
    pub fn new(
        target: &'a dyn TargetExecutor,
        source: SourceType,
        source_schema: impl Into<String>,
        target_schema: impl Into<String>,
    ) -> Self {
        Self {
            target,
            mapper: mapper_for(source),
            dialect: dialect_for(source),
            source_schema: source_schema.into(),
            target_schema: target_schema.into(),
            stub_comment_limit: DEFAULT_STUB_COMMENT_LIMIT,
        }
    }

    pub fn with_stub_comment_limit(mut self, limit: usize) -> Self {
        self.stub_comment_limit = limit;
        self
    }

    /// Translate and apply one routine, falling back to a stub.
    ///
    /// Updates the routine's `translated_text` and `status`. Never fails:
    /// every error is recorded on the returned outcome.
    pub async fn translate(&self, routine: &mut RoutineDescriptor) -> TranslationOutcome {
        let mut outcome = TranslationOutcome::new(routine);
        let signature = match Signature::for_routine(routine, self.mapper.as_ref()) {
            Ok(signature) => signature,
            Err(e) => {
                // Neither the translation nor a stub can be declared.
                error!(routine = %outcome.name, error = %e, "Signature could not be rendered");
                outcome.error_kind = Some(e.kind());
                outcome.message = Some(e.to_string());
                outcome.stub_error = Some(e.to_string());
                outcome.advance(TranslationState::RewriteFailed);
                outcome.advance(TranslationState::StubFailed);
                routine.status = RoutineStatus::Failed;
                return outcome;
            }
        };

        let attempt = match self.rewrite(routine, &signature) {
            Ok(rewritten) => {
                outcome.advance(TranslationState::Rewritten);
                outcome.closers_inserted = rewritten.closers_inserted;
                routine.translated_text = Some(rewritten.statements.join(";\n"));
                self.apply(routine, &rewritten.statements).await
            }
            Err(e) => Err(e),
        };

        let failure = match attempt {
            Ok(()) => {
                outcome.advance(TranslationState::Applied);
                routine.status = RoutineStatus::Translated;
                info!(
                    routine = %outcome.name,
                    kind = %routine.kind,
                    dialect = self.dialect.name(),
                    "Translated"
                );
                return outcome;
            }
            Err(e) => e,
        };

        warn!(
            routine = %outcome.name,
            kind = %routine.kind,
            error = %failure,
            "Translation failed, creating stub"
        );
        outcome.advance(TranslationState::RewriteFailed);
        outcome.error_kind = Some(failure.kind());
        outcome.message = Some(failure.to_string());

        let stubbed = match stub::stub_statements(
            routine,
            &signature,
            &self.target_schema,
            self.stub_comment_limit,
        ) {
            Ok(statements) => self.apply(routine, &statements).await.map(|_| statements),
            Err(e) => Err(e),
        };
        match stubbed {
            Ok(statements) => {
                routine.translated_text = Some(statements.join(";\n"));
                routine.status = RoutineStatus::Stubbed;
                outcome.advance(TranslationState::StubApplied);
            }
            Err(e) => {
                error!(routine = %outcome.name, error = %e, "Stub could not be applied");
                routine.status = RoutineStatus::Failed;
                outcome.stub_error = Some(e.to_string());
                outcome.advance(TranslationState::StubFailed);
            }
        }
        outcome
    }

    /// Rewrite a routine into target statements without touching the target.
    pub fn rewrite(&self, routine: &RoutineDescriptor, signature: &Signature) -> Result<Rewritten> {
        let source = routine.source_text.as_deref().ok_or_else(|| {
            MigrateError::introspection(routine.full_name(), "no definition was fetched")
        })?;
        let ctx = RewriteContext {
            source_schema: self.source_schema.clone(),
            kind: routine.kind,
            returns_void: signature.returns_void(),
        };
        let invalid = |message: String| MigrateError::translation(routine.full_name(), message);
        let body = self.dialect.extract_body(routine, source)?;

        if routine.kind == RoutineKind::View {
            let query = apply_rules(self.dialect.view_rules(), &body, &ctx);
            let query = query.trim().trim_end_matches(';').trim_end();
            if let Verdict::Invalid(message) = check_view(query) {
                return Err(invalid(message));
            }
            return Ok(Rewritten {
                statements: view_statements(&self.target_schema, &routine.name, query)?,
                closers_inserted: 0,
            });
        }

        let body = apply_rules(self.dialect.body_rules(), &body, &ctx);
        let (declarations, body) = self.dialect.hoist_declarations(&body, self.mapper.as_ref());
        let declarations = dedupe_declarations(declarations);
        let mut body = apply_rules(self.dialect.control_rules(), &body, &ctx);

        let mut closers_inserted = 0;
        let verdict = match check_body(&body) {
            Verdict::MissingClosers(count) => {
                warn!(
                    routine = %routine.full_name(),
                    count,
                    "IF block left open, appending END IF"
                );
                body = insert_closers(&body, count);
                closers_inserted = count;
                check_body(&body)
            }
            verdict => verdict,
        };
        match verdict {
            Verdict::Valid => {}
            Verdict::Invalid(message) => return Err(invalid(message)),
            Verdict::MissingClosers(count) => {
                return Err(invalid(format!("{} IF blocks left open", count)))
            }
        }
        debug!(routine = %routine.full_name(), declarations = declarations.len(), "Body rewritten");

        let statements = match routine.kind {
            RoutineKind::Trigger => {
                let info = routine
                    .trigger
                    .as_ref()
                    .ok_or_else(|| invalid("trigger has no table binding".to_string()))?;
                let body = format!("{}\n{}", body.trim_end(), trigger_return(&info.events));
                let mut statements = vec![function_statement(
                    &self.target_schema,
                    &trigger_function_name(&routine.name),
                    signature,
                    &declarations,
                    &body,
                )?];
                statements.extend(trigger_statements(&self.target_schema, &routine.name, info)?);
                statements
            }
            _ => vec![function_statement(
                &self.target_schema,
                &routine.name,
                signature,
                &declarations,
                &body,
            )?],
        };
        Ok(Rewritten {
            statements,
            closers_inserted,
        })
    }

    /// Run `statements` in one transaction, then confirm the object exists.
    async fn apply(&self, routine: &RoutineDescriptor, statements: &[String]) -> Result<()> {
        self.target.execute_transaction(statements).await?;
        let kind = match routine.kind {
            RoutineKind::Procedure => RoutineKind::Function,
            other => other,
        };
        if self
            .target
            .object_exists(&self.target_schema, &routine.name, kind)
            .await?
        {
            Ok(())
        } else {
            Err(MigrateError::translation(
                routine.full_name(),
                format!("no {} named {} in the target catalog after apply", kind, routine.name),
            ))
        }
    }
}

/// Indices into `routines` with every view after the views it selects from,
/// followed by all other routines in discovery order.
///
/// A view depends on another when the other's name appears as an
/// identifier in its definition. Views caught in a cycle are appended in
/// discovery order once nothing else is ready.
pub fn routine_order(routines: &[RoutineDescriptor]) -> Vec<usize> {
    let views: Vec<usize> = (0..routines.len())
        .filter(|&i| routines[i].kind == RoutineKind::View)
        .collect();
    let by_name: HashMap<String, usize> = views
        .iter()
        .map(|&i| (routines[i].name.to_lowercase(), i))
        .collect();

    let mut bases: HashMap<usize, Vec<usize>> = HashMap::new();
    for &i in &views {
        let text = routines[i].source_text.as_deref().unwrap_or("");
        let deps = bases.entry(i).or_default();
        for t in tokenize(text) {
            let name = match t.kind {
                TokenKind::Word => t.text,
                TokenKind::QuotedIdent | TokenKind::Backtick => {
                    t.text.trim_matches(|c: char| c == '"' || c == '`')
                }
                _ => continue,
            };
            if let Some(&j) = by_name.get(&name.to_lowercase()) {
                if j != i && !deps.contains(&j) {
                    deps.push(j);
                }
            }
        }
    }

    let mut placed = HashSet::new();
    let mut order = Vec::with_capacity(routines.len());
    while placed.len() < views.len() {
        let ready = views.iter().copied().find(|i| {
            !placed.contains(i)
                && bases
                    .get(i)
                    .map_or(true, |deps| deps.iter().all(|d| placed.contains(d)))
        });
        match ready {
            Some(i) => {
                placed.insert(i);
                order.push(i);
            }
            None => {
                let stuck: Vec<usize> =
                    views.iter().copied().filter(|i| !placed.contains(i)).collect();
                let names: Vec<String> = stuck.iter().map(|&i| routines[i].full_name()).collect();
                warn!("view dependency cycle among {}, using discovery order", names.join(", "));
                placed.extend(stuck.iter().copied());
                order.extend(stuck);
            }
        }
    }
    order.extend((0..routines.len()).filter(|&i| routines[i].kind != RoutineKind::View));
    order
}

/// First declaration of each name wins; names compare case-insensitively.
fn dedupe_declarations(declarations: Vec<Declaration>) -> Vec<Declaration> {
    let mut seen = HashSet::new();
    declarations
        .into_iter()
        .filter(|d| seen.insert(d.name.to_lowercase()))
        .collect()
}
