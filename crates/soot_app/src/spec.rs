//! App spec parsing: `module:Class` or `module:Class:N`.

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("invalid app spec '{spec}': expected 'module.path:ClassName' or 'module.path:ClassName:N'")]
    BadFormat { spec: String },

    #[error("invalid worker count in spec '{spec}': expected a positive integer, got '{count}'")]
    BadWorkerCount { spec: String, count: String },

    #[error("app not registered: {path}")]
    NotRegistered { path: String },

    #[error("duplicate app registration: {path}")]
    DuplicateRegistration { path: String },
}

/// Parsed form of a user-supplied app spec string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSpec {
    /// The `module:Class` part, unique within a pool.
    pub import_path: String,
    /// Worker cap from the `:N` suffix; `None` when the spec carries no
    /// suffix (the registered limit applies, or unlimited).
    pub worker_count: Option<u32>,
}

/// Parse a spec string.
///
/// ```
/// use soot_app::spec::parse_spec;
///
/// let spec = parse_spec("mymod.sub:Heavy:2").unwrap();
/// assert_eq!(spec.import_path, "mymod.sub:Heavy");
/// assert_eq!(spec.worker_count, Some(2));
/// ```
pub fn parse_spec(spec: &str) -> Result<AppSpec, SpecError> {
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        [module, class] if !module.is_empty() && !class.is_empty() => Ok(AppSpec {
            import_path: format!("{module}:{class}"),
            worker_count: None,
        }),
        [module, class, count] if !module.is_empty() && !class.is_empty() => {
            let worker_count: u32 = count.parse().map_err(|_| SpecError::BadWorkerCount {
                spec: spec.to_string(),
                count: count.to_string(),
            })?;
            if worker_count < 1 {
                return Err(SpecError::BadWorkerCount {
                    spec: spec.to_string(),
                    count: count.to_string(),
                });
            }
            Ok(AppSpec {
                import_path: format!("{module}:{class}"),
                worker_count: Some(worker_count),
            })
        }
        _ => Err(SpecError::BadFormat {
            spec: spec.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_spec() {
        let spec = parse_spec("myapp:App").unwrap();
        assert_eq!(spec.import_path, "myapp:App");
        assert_eq!(spec.worker_count, None);
    }

    #[test]
    fn dotted_module() {
        let spec = parse_spec("myapp.sub:App:1").unwrap();
        assert_eq!(spec.import_path, "myapp.sub:App");
        assert_eq!(spec.worker_count, Some(1));
    }

    #[test]
    fn limited_spec() {
        let spec = parse_spec("myapp:App:2").unwrap();
        assert_eq!(spec.worker_count, Some(2));
    }

    #[test]
    fn missing_colon_rejected() {
        assert!(matches!(
            parse_spec("justamodule"),
            Err(SpecError::BadFormat { .. })
        ));
    }

    #[test]
    fn too_many_colons_rejected() {
        assert!(matches!(
            parse_spec("a:B:2:extra"),
            Err(SpecError::BadFormat { .. })
        ));
    }

    #[test]
    fn empty_parts_rejected() {
        assert!(parse_spec(":App").is_err());
        assert!(parse_spec("mod:").is_err());
    }

    #[test]
    fn bad_counts_rejected() {
        assert!(matches!(
            parse_spec("a:B:zero"),
            Err(SpecError::BadWorkerCount { .. })
        ));
        assert!(matches!(
            parse_spec("a:B:0"),
            Err(SpecError::BadWorkerCount { .. })
        ));
        assert!(matches!(
            parse_spec("a:B:-1"),
            Err(SpecError::BadWorkerCount { .. })
        ));
    }
}
