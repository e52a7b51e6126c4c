// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Mailbox handle
//!
//! A `MailboxHandle` identifies a broker-side queue and binding. The broker never sees the plain
//! name: it sees the scoped name, derived once from the name, the scope and the process-wide
//! `SystemId`.
//!

use crate::Error;

use serde::{Deserialize, Serialize};

use std::fmt::{self, Formatter};

/// Namespace breadth of a mailbox name.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Scope {
    /// Visible across every system sharing the broker.
    Global,
    /// Visible to every container of one system.
    System,
    /// Visible to one container only.
    Local,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::System => write!(f, "system"),
            Scope::Local => write!(f, "local"),
        }
    }
}

/// Process-wide system identifier used to qualify mailbox names.
///
/// `sysname` names the deployment sharing a broker; `container` names the local container that
/// owns the process.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SystemId {
    sysname: String,
    container: String,
}

impl SystemId {
    /// Creates a system identifier.
    pub fn new(sysname: &str, container: &str) -> Self {
        Self {
            sysname: sysname.to_owned(),
            container: container.to_owned(),
        }
    }

    /// The deployment name.
    pub fn sysname(&self) -> &str {
        &self.sysname
    }

    /// The container name.
    pub fn container(&self) -> &str {
        &self.container
    }
}

/// Handle to a broker-resident mailbox.
///
/// The scoped name is computed in the constructor and never changes afterwards.
///
/// ```ignore
/// let system = SystemId::new("prod", "c1");
/// let handle = MailboxHandle::new("jobs", Scope::System, &system)?;
/// assert_eq!(handle.scoped_name(), "prod.jobs");
/// ```
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct MailboxHandle {
    name: String,
    scope: Scope,
    scoped_name: String,
}

impl MailboxHandle {
    /// Creates a mailbox handle and derives its scoped name.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingMailboxName` if `name` is empty or blank.
    ///
    pub fn new(name: &str, scope: Scope, system: &SystemId) -> Result<Self, Error> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::MissingMailboxName);
        }
        let scoped_name = match scope {
            Scope::Global => name.to_owned(),
            Scope::System => format!("{}.{}", system.sysname(), name),
            Scope::Local => {
                format!("{}.{}.{}", system.sysname(), system.container(), name)
            }
        };
        Ok(Self {
            name: name.to_owned(),
            scope,
            scoped_name,
        })
    }

    /// The unqualified mailbox name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scope class of the mailbox.
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// The broker-visible name.
    pub fn scoped_name(&self) -> &str {
        &self.scoped_name
    }
}

impl fmt::Display for MailboxHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.scoped_name)
    }
}
