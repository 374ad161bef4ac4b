#![deny(clippy::all)]

//! Task identifiers.
//!
//! A [`TaskId`] is always fully qualified (`package#task`); a [`TaskName`]
//! is what appears in configuration and may or may not carry a package
//! qualifier. Both borrow where possible and can be promoted to `'static`
//! with [`TaskId::into_owned`] / [`TaskName::into_owned`].

use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};

pub const TASK_DELIMITER: &str = "#";
pub const ROOT_PKG_NAME: &str = "//";

#[derive(Debug, thiserror::Error)]
#[error("'{input}' is not a fully qualified task id")]
pub struct TaskIdError {
    input: String,
}

/// A task instance: a package plus the task to run in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId<'a> {
    package: Cow<'a, str>,
    task: Cow<'a, str>,
}

/// A task as named in configuration or on the command line: either a bare
/// task (`build`) or package-qualified (`web#build`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskName<'a> {
    package: Option<Cow<'a, str>>,
    task: Cow<'a, str>,
}

impl<'a> TaskId<'a> {
    pub fn new(package: &'a str, task: &'a str) -> Self {
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn from_static(package: String, task: String) -> TaskId<'static> {
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn in_workspace(&self, workspace: &str) -> bool {
        self.package == workspace
    }

    pub fn to_workspace_name(&self) -> TaskName<'static> {
        TaskName {
            package: Some(self.package.to_string().into()),
            task: self.task.to_string().into(),
        }
    }

    /// The task name without the package qualifier.
    pub fn as_non_workspace_task_name(&self) -> TaskName {
        TaskName {
            package: None,
            task: self.task.as_ref().into(),
        }
    }

    pub fn into_owned(self) -> TaskId<'static> {
        let TaskId { package, task } = self;
        TaskId {
            package: package.into_owned().into(),
            task: task.into_owned().into(),
        }
    }
}

impl fmt::Display for TaskId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TASK_DELIMITER}{}", self.package, self.task)
    }
}

impl<'a> TryFrom<&'a str> for TaskId<'a> {
    type Error = TaskIdError;

    fn try_from(value: &'a str) -> Result<Self, Self::Error> {
        match value.split_once(TASK_DELIMITER) {
            Some((package, task)) if !package.is_empty() && !task.is_empty() => Ok(TaskId {
                package: package.into(),
                task: task.into(),
            }),
            _ => Err(TaskIdError {
                input: value.to_string(),
            }),
        }
    }
}

impl<'a> TaskName<'a> {
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn is_package_qualified(&self) -> bool {
        self.package.is_some()
    }

    /// Returns the concrete task id when this name is package-qualified.
    pub fn task_id(&self) -> Option<TaskId<'_>> {
        let package = self.package.as_deref()?;
        Some(TaskId {
            package: package.into(),
            task: self.task.as_ref().into(),
        })
    }

    /// Strips the package qualifier.
    pub fn into_non_workspace_task(self) -> TaskName<'a> {
        TaskName {
            package: None,
            task: self.task,
        }
    }

    pub fn into_owned(self) -> TaskName<'static> {
        let TaskName { package, task } = self;
        TaskName {
            package: package.map(|p| Cow::from(p.into_owned())),
            task: task.into_owned().into(),
        }
    }
}

impl fmt::Display for TaskName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(package) => write!(f, "{package}{TASK_DELIMITER}{}", self.task),
            None => f.write_str(&self.task),
        }
    }
}

impl<'a> From<&'a str> for TaskName<'a> {
    fn from(value: &'a str) -> Self {
        match value.split_once(TASK_DELIMITER) {
            Some((package, task)) if !package.is_empty() => TaskName {
                package: Some(package.into()),
                task: task.into(),
            },
            _ => TaskName {
                package: None,
                task: value.into(),
            },
        }
    }
}

impl From<String> for TaskName<'static> {
    fn from(value: String) -> Self {
        TaskName::from(value.as_str()).into_owned()
    }
}

impl<'a> From<TaskId<'a>> for TaskName<'a> {
    fn from(value: TaskId<'a>) -> Self {
        TaskName {
            package: Some(value.package),
            task: value.task,
        }
    }
}
