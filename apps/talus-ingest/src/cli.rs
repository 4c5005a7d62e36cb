use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub project_id: String,
    pub files: Vec<PathBuf>,
}

enum ParseOutcome {
    Args(CliArgs),
    Help,
}

fn usage() {
    eprintln!(
        "usage:
  talus-ingest [--config <path>] [--project <id>] <file>...
"
    );
}

fn parse_args_impl(mut args: impl Iterator<Item = String>) -> Result<ParseOutcome, String> {
    let mut config_path: Option<PathBuf> = None;
    let mut project_id: Option<String> = None;
    let mut files = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--config requires a value".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            "--project" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--project requires a value".to_string())?;
                project_id = Some(value);
            }
            "-h" | "--help" | "help" => {
                return Ok(ParseOutcome::Help);
            }
            other => files.push(PathBuf::from(other)),
        }
    }

    if files.is_empty() {
        return Err("at least one log file is required".to_string());
    }

    Ok(ParseOutcome::Args(CliArgs {
        config_path: talus_config::resolve_config_path(config_path),
        project_id: project_id.unwrap_or_else(|| "default".to_string()),
        files,
    }))
}

pub fn parse_args() -> CliArgs {
    match parse_args_impl(std::env::args().skip(1)) {
        Ok(ParseOutcome::Args(args)) => args,
        Ok(ParseOutcome::Help) => {
            usage();
            std::process::exit(0);
        }
        Err(error) => {
            eprintln!("error: {error}");
            usage();
            std::process::exit(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_args_impl, ParseOutcome};
    use std::path::PathBuf;

    fn args(raw: &[&str]) -> impl Iterator<Item = String> {
        raw.iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn parse_args_rejects_missing_files() {
        let result = parse_args_impl(args(&["--project", "p1"]));
        assert!(matches!(
            result,
            Err(error) if error == "at least one log file is required"
        ));
    }

    #[test]
    fn parse_args_rejects_project_without_value() {
        let result = parse_args_impl(args(&["--project"]));
        assert!(matches!(
            result,
            Err(error) if error == "--project requires a value"
        ));
    }

    #[test]
    fn parse_args_collects_files_and_project() {
        let result = parse_args_impl(args(&["--project", "p7", "a.log", "b.log"]));

        let ParseOutcome::Args(parsed) = result.expect("parse success") else {
            panic!("expected parsed args");
        };

        assert_eq!(parsed.project_id, "p7");
        assert_eq!(
            parsed.files,
            vec![PathBuf::from("a.log"), PathBuf::from("b.log")]
        );
    }
}
