//! 带命名空间的工具标识：`<backend>.<tool>`

use std::fmt;

/// 工具标识，在建立工具目录时构造；后端名取第一个 `.` 之前的部分
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ToolIdentifier {
    pub backend: String,
    pub name: String,
}

impl ToolIdentifier {
    pub fn new(backend: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            name: name.into(),
        }
    }

    /// 解析限定名；缺少 `.` 或任一部分为空时返回 None
    pub fn parse(qualified: &str) -> Option<Self> {
        let (backend, name) = qualified.split_once('.')?;
        if backend.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(backend, name))
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.backend, self.name)
    }
}

impl fmt::Display for ToolIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.backend, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_first_dot() {
        let id = ToolIdentifier::parse("files.read.v2").unwrap();
        assert_eq!(id.backend, "files");
        assert_eq!(id.name, "read.v2");
        assert_eq!(id.to_string(), "files.read.v2");
    }

    #[test]
    fn rejects_unqualified_names() {
        assert!(ToolIdentifier::parse("echo").is_none());
        assert!(ToolIdentifier::parse(".echo").is_none());
        assert!(ToolIdentifier::parse("local.").is_none());
    }
}
