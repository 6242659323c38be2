use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rusqlite::Connection;

use ordercheck::config::{self, AppConfig};
use ordercheck::db::{self, CodingReference};
use ordercheck::models::{PatientContext, PromptTemplate, ValidationRequest};
use ordercheck::pipeline::context::SqliteCodingContext;
use ordercheck::pipeline::prompt_templates::{SqliteTemplateStore, TemplateResolver};
use ordercheck::pipeline::recorder::SqliteAttemptRecorder;
use ordercheck::pipeline::{FailoverOrchestrator, ValidationController, ValidationError};

/// Exit status when validation fails with an explicit error kind.
const EXIT_VALIDATION_FAILED: i32 = 2;

#[derive(Parser)]
#[command(name = "ordercheck", version = config::APP_VERSION)]
#[command(about = "Validate imaging-order dictation against coding guidelines")]
struct Cli {
    /// JSON configuration file
    #[arg(long, short)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate dictation read from stdin and print the outcome as JSON
    Validate {
        #[arg(long, default_value = "anonymous")]
        patient_id: String,
        #[arg(long)]
        age: Option<u32>,
        #[arg(long)]
        gender: Option<String>,
        /// Specialty-scoped template to prefer
        #[arg(long)]
        specialty: Option<String>,
        #[arg(long)]
        physician: Option<String>,
        #[arg(long)]
        organization: Option<String>,
        /// Supplemental text for each clarification round, in order
        #[arg(long = "clarification")]
        clarifications: Vec<String>,
    },
    /// Insert a prompt template from a JSON file
    ImportTemplate {
        file: PathBuf,
        /// Make it the active template of its category
        #[arg(long)]
        activate: bool,
    },
    /// Upsert coding reference entries from a JSON array file
    ImportCodes { file: PathBuf },
    /// Print the recorded attempts of a session as JSON
    Attempts { session_id: uuid::Uuid },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    ordercheck::init_tracing();
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;
    tracing::info!("{} v{}", config::APP_NAME, config::APP_VERSION);

    match cli.command {
        Commands::Validate {
            patient_id,
            age,
            gender,
            specialty,
            physician,
            organization,
            clarifications,
        } => {
            let mut dictation = String::new();
            std::io::stdin().read_to_string(&mut dictation)?;

            let mut request = ValidationRequest::new(
                dictation.trim(),
                PatientContext::new(&patient_id).with_demographics(age, gender.as_deref()),
            );
            request.specialty = specialty;
            request.physician_id = physician;
            request.organization_id = organization;

            let controller = build_controller(&config)?;
            if let Err(e) = run_validation(&controller, request, &clarifications) {
                let report = serde_json::json!({
                    "error": e.kind(),
                    "message": e.to_string(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
                std::process::exit(EXIT_VALIDATION_FAILED);
            }
        }
        Commands::ImportTemplate { file, activate } => {
            let template: PromptTemplate = read_json(&file)?;
            let mut conn = open_store(&config.database_path)?;
            db::insert_template(&conn, &PromptTemplate { active: false, ..template.clone() })?;
            if activate || template.active {
                db::activate_template(&mut conn, &template.id)?;
            }
            println!(
                "Imported template {} ({} v{})",
                template.id, template.category, template.version
            );
        }
        Commands::ImportCodes { file } => {
            let entries: Vec<CodingReference> = read_json(&file)?;
            let conn = open_store(&config.database_path)?;
            for entry in &entries {
                db::upsert_coding_reference(&conn, entry)?;
            }
            println!("Imported {} coding reference entries", entries.len());
        }
        Commands::Attempts { session_id } => {
            let recorder = SqliteAttemptRecorder::new(open_store(&config.database_path)?);
            let attempts = recorder.attempts_for_session(&session_id)?;
            println!("{}", serde_json::to_string_pretty(&attempts)?);
        }
    }

    Ok(())
}

fn run_validation(
    controller: &ValidationController,
    request: ValidationRequest,
    clarifications: &[String],
) -> Result<(), ValidationError> {
    let mut outcome = controller.validate(request)?;
    for text in clarifications {
        if outcome.is_final() {
            break;
        }
        outcome = controller.continue_with_clarification(&outcome.session_id, text)?;
    }
    match serde_json::to_string_pretty(&outcome) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(error = %e, "Failed to serialize outcome"),
    }
    Ok(())
}

fn build_controller(config: &AppConfig) -> Result<ValidationController, Box<dyn std::error::Error>> {
    let orchestrator = FailoverOrchestrator::from_settings(&config.providers)?;
    Ok(ValidationController::new(
        TemplateResolver::new(Arc::new(SqliteTemplateStore::new(open_store(&config.database_path)?))),
        Arc::new(SqliteCodingContext::new(open_store(&config.database_path)?)),
        orchestrator,
        Arc::new(SqliteAttemptRecorder::new(open_store(&config.database_path)?)),
        config.session,
    ))
}

fn open_store(path: &Path) -> Result<Connection, Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(db::open_database(path)?)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
