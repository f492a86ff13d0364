//! Typed ID definitions for scheduler resources.

use crate::define_id;

define_id!(WorkspaceId, "ws");
define_id!(RunId, "run");
define_id!(UserId, "user");

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_workspace_id_roundtrip() {
        let id = WorkspaceId::new();
        let parsed: WorkspaceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_run_id_prefix() {
        assert!(RunId::new().to_string().starts_with("run_"));
    }

    #[test]
    fn test_run_id_rejects_workspace_prefix() {
        let result: Result<RunId, _> = "ws_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        let err = result.unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<UserId, _> = "user01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert_eq!(result.unwrap_err(), crate::IdError::MissingSeparator);
    }

    #[test]
    fn test_empty() {
        let result: Result<UserId, _> = "".parse();
        assert_eq!(result.unwrap_err(), crate::IdError::Empty);
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<WorkspaceId, _> = "ws_invalid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_json_is_prefixed_string() {
        let id = RunId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: RunId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_ids_sort_by_creation_time() {
        let earlier = RunId::from_ulid(crate::Ulid::from_parts(1_000, 0));
        let later = RunId::from_ulid(crate::Ulid::from_parts(2_000, 0));
        assert!(earlier < later);
    }

    #[test]
    fn test_prefixes_are_unique() {
        let prefixes = [WorkspaceId::PREFIX, RunId::PREFIX, UserId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn parse_never_panics(s in "\\PC*") {
            let _ = WorkspaceId::parse(&s);
        }

        #[test]
        fn any_ulid_roundtrips(ms in 0u64..(1u64 << 47), rand in any::<u128>()) {
            let id = UserId::from_ulid(crate::Ulid::from_parts(ms, rand));
            prop_assert_eq!(UserId::parse(&id.to_string()).unwrap(), id);
        }
    }
}
