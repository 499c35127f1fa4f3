//! stress-ng argument normalization.

use havoc_core::{HavocError, Result, StressAction, StressCommand};

/// Translate a stress command into the stress-ng argument vector.
///
/// `cpu` becomes `--cpu <workers> --cpu-load <load>`, `mem` becomes
/// `--vm <workers>` plus `--vm-bytes <size>` when a size is given. Extra
/// options are appended after being split on whitespace.
pub fn normalize(command: &StressCommand) -> Result<Vec<String>> {
    if command.workers == 0 {
        return Err(HavocError::Execution(
            "stressor requires at least one worker".to_string(),
        ));
    }
    let action = command
        .stress_action()
        .map_err(|e| HavocError::Execution(e.to_string()))?;

    let mut args = Vec::new();
    match action {
        StressAction::Cpu => {
            args.push("--cpu".to_string());
            args.push(command.workers.to_string());
            args.push("--cpu-load".to_string());
            args.push(command.load.to_string());
        }
        StressAction::Mem => {
            args.push("--vm".to_string());
            args.push(command.workers.to_string());
            if let Some(size) = command.size.as_deref().filter(|s| !s.trim().is_empty()) {
                args.push("--vm-bytes".to_string());
                args.push(size.trim().to_string());
            }
        }
    }

    args.extend(
        command
            .options
            .iter()
            .flat_map(|opt| opt.split_whitespace())
            .map(str::to_string),
    );
    Ok(args)
}
