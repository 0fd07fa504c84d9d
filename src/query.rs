//! Statement dispatch and measurement name normalization
//!
//! Statements arrive already parsed. Topology statements map onto server
//! commands; selects are handed to a pluggable planner and their rows are
//! streamed off a channel. Execution halts at the first statement-level
//! error and the remaining results carry a "not executed" sentinel.

use crate::meta::RetentionPolicy;
use crate::server::Server;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;

/// A parsed select statement. The planner owns its interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectStatement {
    /// Fully qualified statement text.
    pub text: String,
}

/// A parsed statement ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    CreateDatabase {
        name: String,
    },
    DropDatabase {
        name: String,
    },
    ListDatabases,
    CreateUser {
        name: String,
        password: String,
        admin: bool,
    },
    DropUser {
        name: String,
    },
    CreateRetentionPolicy {
        database: String,
        name: String,
        duration: Duration,
        replica_n: u32,
    },
    AlterRetentionPolicy {
        database: String,
        name: String,
        new_name: Option<String>,
    },
    DropRetentionPolicy {
        database: String,
        name: String,
    },
    ListRetentionPolicies {
        database: String,
    },
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<Vec<serde_json::Value>>,
}

/// Resultset of a single statement.
#[derive(Debug, Default)]
pub struct StatementResult {
    pub rows: Vec<Row>,
    pub err: Option<Error>,
}

impl StatementResult {
    fn from_op(result: Result<()>) -> Self {
        Self {
            rows: Vec::new(),
            err: result.err(),
        }
    }
}

/// Results of all statements in a query, in statement order.
#[derive(Debug, Default)]
pub struct Results(pub Vec<StatementResult>);

impl Results {
    /// First error from any statement, if one occurred.
    pub fn error(&self) -> Option<&Error> {
        self.0.iter().find_map(|r| r.err.as_ref())
    }
}

/// Port onto the external query planner/executor.
#[async_trait]
pub trait QueryPlanner: Send + Sync {
    /// Plan a select statement against a database and return its row stream.
    async fn plan(&self, stmt: &SelectStatement, database: &str) -> Result<mpsc::Receiver<Row>>;
}

impl Server {
    /// Execute parsed statements in order, stopping at the first error.
    pub async fn execute_query(
        &self,
        statements: Vec<Statement>,
        database: &str,
        planner: &dyn QueryPlanner,
    ) -> Results {
        let mut results = Vec::with_capacity(statements.len());
        let mut failed = false;
        for stmt in statements {
            if failed {
                results.push(StatementResult {
                    rows: Vec::new(),
                    err: Some(Error::NotExecuted),
                });
                continue;
            }
            let result = self.execute_statement(stmt, database, planner).await;
            failed = result.err.is_some();
            results.push(result);
        }
        Results(results)
    }

    async fn execute_statement(
        &self,
        stmt: Statement,
        database: &str,
        planner: &dyn QueryPlanner,
    ) -> StatementResult {
        match stmt {
            Statement::Select(stmt) => self.execute_select(&stmt, database, planner).await,
            Statement::CreateDatabase { name } => {
                StatementResult::from_op(self.create_database(&name).await)
            }
            Statement::DropDatabase { name } => {
                StatementResult::from_op(self.delete_database(&name).await)
            }
            Statement::ListDatabases => StatementResult {
                rows: vec![Row {
                    columns: vec!["name".to_string()],
                    values: self
                        .databases()
                        .into_iter()
                        .map(|name| vec![serde_json::Value::String(name)])
                        .collect(),
                }],
                err: None,
            },
            Statement::CreateUser {
                name,
                password,
                admin,
            } => StatementResult::from_op(self.create_user(&name, &password, admin).await),
            Statement::DropUser { name } => StatementResult::from_op(self.delete_user(&name).await),
            Statement::CreateRetentionPolicy {
                database,
                name,
                duration,
                replica_n,
            } => {
                let mut rp = RetentionPolicy::new(name);
                rp.duration = duration;
                rp.replica_n = replica_n;
                StatementResult::from_op(self.create_retention_policy(&database, &rp).await)
            }
            Statement::AlterRetentionPolicy {
                database,
                name,
                new_name,
            } => StatementResult::from_op(
                self.update_retention_policy(&database, &name, new_name.as_deref().unwrap_or(""))
                    .await,
            ),
            Statement::DropRetentionPolicy { database, name } => {
                StatementResult::from_op(self.delete_retention_policy(&database, &name).await)
            }
            Statement::ListRetentionPolicies { database } => {
                match self.retention_policies(&database) {
                    Ok(policies) => StatementResult {
                        rows: vec![Row {
                            columns: vec!["name".to_string()],
                            values: policies
                                .into_iter()
                                .map(|rp| vec![serde_json::Value::String(rp.name)])
                                .collect(),
                        }],
                        err: None,
                    },
                    Err(e) => StatementResult {
                        rows: Vec::new(),
                        err: Some(e),
                    },
                }
            }
        }
    }

    async fn execute_select(
        &self,
        stmt: &SelectStatement,
        database: &str,
        planner: &dyn QueryPlanner,
    ) -> StatementResult {
        match planner.plan(stmt, database).await {
            Ok(mut rx) => {
                let mut rows = Vec::new();
                while let Some(row) = rx.recv().await {
                    rows.push(row);
                }
                StatementResult { rows, err: None }
            }
            Err(e) => StatementResult {
                rows: Vec::new(),
                err: Some(e),
            },
        }
    }

    /// Fully qualify a measurement name as `database.policy.name`, filling
    /// missing segments from the default database and the database's default
    /// retention policy, and validating that both exist.
    pub fn normalize_measurement(&self, name: &str, default_database: &str) -> Result<String> {
        let mut segments =
            split_ident(name).map_err(|_| Error::InvalidMeasurement(name.to_string()))?;
        match segments.len() {
            1 => {
                segments.insert(0, String::new());
                segments.insert(0, String::new());
            }
            2 => segments.insert(0, String::new()),
            3 => {}
            _ => return Err(Error::InvalidMeasurement(name.to_string())),
        }

        if segments[0].is_empty() {
            segments[0] = default_database.to_string();
        }
        if !self.database_exists(&segments[0]) {
            return Err(Error::DatabaseNotFound);
        }

        if segments[1].is_empty() {
            match self.default_retention_policy(&segments[0])? {
                Some(rp) => segments[1] = rp.name,
                None => return Err(Error::DefaultRetentionPolicyNotFound),
            }
        }
        if self.retention_policy(&segments[0], &segments[1])?.is_none() {
            return Err(Error::RetentionPolicyNotFound);
        }

        Ok(quote_ident(&segments))
    }
}

/// Splits a dotted identifier into segments, honoring double quotes.
pub fn split_ident(s: &str) -> Result<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => quoted = !quoted,
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '.' if !quoted => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if quoted {
        return Err(Error::InvalidMeasurement(s.to_string()));
    }
    segments.push(current);
    Ok(segments)
}

/// Joins segments into a dotted identifier, quoting segments that need it.
pub fn quote_ident(segments: &[String]) -> String {
    segments
        .iter()
        .map(|segment| {
            let plain = !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_');
            if plain {
                segment.clone()
            } else {
                format!("\"{}\"", segment.replace('\\', "\\\\").replace('"', "\\\""))
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ident() {
        assert_eq!(split_ident("cpu").unwrap(), vec!["cpu"]);
        assert_eq!(split_ident("db.rp.cpu").unwrap(), vec!["db", "rp", "cpu"]);
        assert_eq!(
            split_ident("db.\"a.b\".cpu").unwrap(),
            vec!["db", "a.b", "cpu"]
        );
        assert!(split_ident("db.\"unbalanced").is_err());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(
            quote_ident(&["db".to_string(), "rp".to_string(), "cpu".to_string()]),
            "db.rp.cpu"
        );
        assert_eq!(
            quote_ident(&["db".to_string(), "a.b".to_string()]),
            "db.\"a.b\""
        );
    }
}
