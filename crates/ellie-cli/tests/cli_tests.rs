#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};
    use ellie_cli::Cli;

    // ── Argument parsing ───────────────────────────────────────

    mod parsing {
        use super::*;

        #[test]
        fn test_command_definition_is_consistent() {
            Cli::command().debug_assert();
        }

        #[test]
        fn test_retrieve_accepts_scope_flags() {
            let org = "6f1c2b9e-3f4a-4c8e-9a51-2d7b0c1e8f00";
            let room = "0b5e8c1d-7a2f-4e63-8d9c-4f1a2b3c4d5e";
            let parsed = Cli::try_parse_from(["ellie", "retrieve", org, "kafka lag", "--room", room, "-n", "3"]);
            assert!(parsed.is_ok());
        }

        #[test]
        fn test_retrieve_rejects_bad_org_id() {
            assert!(Cli::try_parse_from(["ellie", "retrieve", "not-a-uuid", "query"]).is_err());
        }

        #[test]
        fn test_verbose_and_quiet_conflict() {
            assert!(Cli::try_parse_from(["ellie", "-v", "-q", "config"]).is_err());
        }

        #[test]
        fn test_evaluate_requires_fixtures() {
            assert!(Cli::try_parse_from(["ellie", "evaluate"]).is_err());
            assert!(Cli::try_parse_from(["ellie", "evaluate", "--fixtures", "cases.jsonl"]).is_ok());
        }

        #[test]
        fn test_global_config_flag_after_subcommand() {
            assert!(Cli::try_parse_from(["ellie", "tune", "-f", "cases.jsonl", "--config", "ellie.toml"]).is_ok());
        }
    }
}
