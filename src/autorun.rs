//! Per-language autorun commands (C10), sourced from the static YAML
//! configuration rather than the database-backed global autorun row
//! ([`crate::persistence::GlobalConfigRow`], consulted directly by
//! `staging::run_autorun`). Both are enqueued on an agent's first STAGE2
//! activation; this one is fixed at process start, the other is
//! operator-settable at runtime.

use crate::collab::AutorunProvider;
use crate::config::AutorunConfig;
use crate::dispatch::Opcode;
use crate::packet::Language;

pub struct ConfigAutorunProvider {
    config: AutorunConfig,
}

impl ConfigAutorunProvider {
    pub fn new(config: AutorunConfig) -> Self {
        Self { config }
    }
}

impl AutorunProvider for ConfigAutorunProvider {
    fn commands_for(&self, language: Language) -> Vec<(u16, Vec<u8>)> {
        let commands = match language {
            Language::Powershell => &self.config.powershell,
            Language::Python => &self.config.python,
        };
        commands
            .iter()
            .map(|cmd| (Opcode::TaskShell.to_u16(), cmd.clone().into_bytes()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_commands_by_language() {
        let config = AutorunConfig {
            global_command: String::new(),
            global_data: String::new(),
            powershell: vec!["whoami".to_string()],
            python: vec!["import os".to_string()],
        };
        let provider = ConfigAutorunProvider::new(config);

        let ps = provider.commands_for(Language::Powershell);
        assert_eq!(ps, vec![(Opcode::TaskShell.to_u16(), b"whoami".to_vec())]);

        let py = provider.commands_for(Language::Python);
        assert_eq!(py, vec![(Opcode::TaskShell.to_u16(), b"import os".to_vec())]);
    }

    #[test]
    fn empty_list_yields_no_commands() {
        let provider = ConfigAutorunProvider::new(AutorunConfig::default());
        assert!(provider.commands_for(Language::Powershell).is_empty());
    }
}
