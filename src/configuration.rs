// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

//! Module that handles the configuration of the application.

use crate::{
    cli::{IndexingArgs, SyncMode},
    constants, error_codes,
    handlers::MissingGoalPolicy,
    metrics::MetricsConfig,
};
use alloy::primitives::Address;
use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use secrecy::SecretString;
use serde::Deserialize;
use std::{path::Path, str::FromStr};

/// Prefix of the environment variables that override the configuration file, i.e. `VOUCHIE_RPC_URL`.
pub const ENVIRONMENT_PREFIX: &str = "VOUCHIE";

/// Configuration as parsed from a file. Fields are optional to allow partial configs.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FileConfiguration {
    pub rpc_url: Option<SecretString>,
    pub contract: Option<String>,
    pub start_block: Option<u64>,
    pub block_range: Option<usize>,
    pub sync_mode: Option<SyncMode>,
    pub database_path: Option<String>,
    pub api_server_address: Option<String>,
    pub api_server_port: Option<u16>,
    pub missing_goal_policy: Option<MissingGoalPolicy>,
    pub max_event_retries: Option<u32>,
}

/// Fully resolved configuration with all defaults applied.
#[derive(Debug, Clone)]
pub struct IndexerConfiguration {
    pub rpc_url: SecretString,
    pub contract_address: Address,
    pub start_block: u64,
    pub block_range: usize,
    pub sync_mode: SyncMode,
    pub database_path: String,
    pub api_server_address: String,
    pub api_server_port: u16,
    pub verbosity: u8,
    pub missing_goal_policy: MissingGoalPolicy,
    pub max_event_retries: u32,
    pub metrics: MetricsConfig,
}

impl IndexerConfiguration {
    /// Build the indexer configuration from CLI arguments.
    ///
    /// If a config file is provided, it takes precedence for all file-based fields.
    /// CLI-only options (`verbosity`, `strict_mode`, metrics) are always taken from the command line.
    ///
    /// # Panics
    ///
    /// This function will log an error and exit the process if the configuration file
    /// cannot be found, contains parsing errors, or the resulting configuration is incomplete.
    pub fn from_args(args: IndexingArgs) -> Self {
        let file_config = if let Some(ref config_file) = args.config {
            if args.verbosity >= 2 {
                println!("Loading configuration from file: {}", config_file);
                println!("CLI arguments for file-based fields will be ignored");
            }
            match FileConfiguration::load(config_file) {
                Ok(config) => config,
                Err(e) => {
                    match e {
                        ConfigError::NotFound(ref property) => eprintln!(
                            "\x1b[31merror:\x1b[0m Configuration property not found: {}",
                            property
                        ),
                        ConfigError::FileParse { ref uri, ref cause } => {
                            eprintln!(
                                "\x1b[31merror:\x1b[0m Failed to parse configuration file: {}",
                                uri.as_deref().unwrap_or(config_file)
                            );
                            eprintln!("Parse error: {}", cause);
                        }
                        _ => eprintln!(
                            "\x1b[31merror:\x1b[0m Failed to load configuration from file '{}': {}",
                            config_file, e
                        ),
                    }
                    std::process::exit(error_codes::ERROR_CODE_FAILED_TO_LOAD_CONFIGURATION_FROM_FILE);
                }
            }
        } else {
            FileConfiguration::from_args(&args)
        };

        match Self::resolve(file_config, &args) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("\x1b[31merror:\x1b[0m {e:#}");
                std::process::exit(error_codes::ERROR_CODE_WRONG_INPUT_ARGUMENTS);
            }
        }
    }

    /// Parse CLI arguments and build the indexer configuration.
    ///
    /// # Panics
    ///
    /// This function will log an error and exit the process if the configuration is not valid.
    pub fn parse() -> Self {
        let args = IndexingArgs::parse();
        Self::from_args(args)
    }

    /// Applies the defaults to a file configuration and merges it with the CLI-only options.
    pub fn resolve(file_config: FileConfiguration, args: &IndexingArgs) -> Result<Self> {
        let rpc_url = file_config
            .rpc_url
            .context("An RPC URL is required (--rpc-host or rpc_url)")?;
        let contract = file_config
            .contract
            .context("The VouchieVault address is required (--contract or contract)")?;
        let contract_address = Address::from_str(&contract)
            .with_context(|| format!("Invalid contract address: {contract}"))?;

        // Strict mode can only make the policy stricter.
        let missing_goal_policy = if args.strict_mode {
            MissingGoalPolicy::Reject
        } else {
            file_config.missing_goal_policy.unwrap_or_default()
        };

        Ok(Self {
            rpc_url,
            contract_address,
            start_block: file_config.start_block.unwrap_or(0),
            block_range: file_config
                .block_range
                .unwrap_or(constants::DEFAULT_BLOCK_RANGE),
            sync_mode: file_config.sync_mode.unwrap_or_default(),
            database_path: file_config
                .database_path
                .unwrap_or_else(|| constants::DUCKDB_FILE_PATH.to_string()),
            api_server_address: file_config
                .api_server_address
                .unwrap_or_else(|| constants::DEFAULT_API_SERVER_ADDRESS.to_string()),
            api_server_port: file_config
                .api_server_port
                .unwrap_or(constants::DEFAULT_API_SERVER_PORT),
            verbosity: args.verbosity,
            missing_goal_policy,
            max_event_retries: file_config
                .max_event_retries
                .unwrap_or(args.max_event_retries),
            metrics: MetricsConfig {
                enabled: args.metrics,
                address: args.metrics_address.clone(),
                port: args.metrics_port,
                allow_origin: args.metrics_allow_origin.clone(),
            },
        })
    }
}

impl FileConfiguration {
    /// Build from CLI arguments (no config file).
    pub fn from_args(args: &IndexingArgs) -> Self {
        Self {
            rpc_url: args.rpc_host.clone().map(SecretString::from),
            contract: args.contract.clone(),
            start_block: args.start_block,
            block_range: Some(args.block_range),
            sync_mode: Some(args.sync_mode),
            database_path: args.database.clone(),
            api_server_address: args
                .api_server
                .as_ref()
                .and_then(|s| s.split(':').next())
                .map(|s| s.to_string()),
            api_server_port: args
                .api_server
                .as_ref()
                .and_then(|s| s.split(':').nth(1))
                .and_then(|p| p.parse().ok()),
            missing_goal_policy: None,
            max_event_retries: Some(args.max_event_retries),
        }
    }

    /// Load from a YAML/JSON/TOML file, with `VOUCHIE_` environment variables on top.
    pub fn load(config_file: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(Path::new(config_file)))
            .add_source(Environment::with_prefix(ENVIRONMENT_PREFIX))
            .build()?
            .try_deserialize()
    }
}
