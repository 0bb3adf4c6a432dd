use agir_core::config::AppConfig;
use agir_core::error::{AgirError, ErrorKind};
use agir_core::process::ProcessDefinition;
use agir_test_utils::{write_temp_file, CLINIC_YAML};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
temperature = 0.2
max_tokens = 512
max_steps = 12
reflect = false

[database]
path = "/tmp/agir-test/agir.db"

[providers.openai]
api_key = "sk-test-key"

[providers.ollama]
base_url = "http://gpu-box:11434"

[retry]
max_retries = 3
initial_backoff_ms = 250
timeout_secs = 30

[[users]]
username = "dr_house"
model = "gpt-4o"
first_name = "Gregory"

[[users]]
username = "retired"
model = "llama3"
is_active = false
"#;

    let tmp = write_temp_file(toml_content);
    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.temperature, 0.2);
    assert_eq!(config.engine.max_tokens, 512);
    assert_eq!(config.engine.max_steps, 12);
    assert!(!config.engine.reflect);
    assert_eq!(config.engine.reflection_max_tokens, 2000);
    assert_eq!(
        config.database_path().to_str(),
        Some("/tmp/agir-test/agir.db")
    );
    assert_eq!(config.provider("openai").api_key.as_deref(), Some("sk-test-key"));
    assert_eq!(
        config.provider("ollama").base_url.as_deref(),
        Some("http://gpu-box:11434")
    );
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.retry.initial_backoff_ms, 250);
    assert_eq!(config.retry.max_backoff_ms, 30000);
    assert_eq!(config.retry.timeout_secs, Some(30));

    assert_eq!(config.users.len(), 2);
    let house = config.users[0].to_user();
    assert_eq!(house.configured_model(), Some("gpt-4o"));
    assert_eq!(house.display_name(), "Gregory");
    assert!(!config.users[1].to_user().is_active);
}

#[test]
fn test_empty_config_uses_defaults() {
    let tmp = write_temp_file("");
    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.temperature, 0.7);
    assert_eq!(config.engine.max_tokens, 1000);
    assert_eq!(config.engine.max_steps, 100);
    assert!(config.engine.reflect);
    assert!(config.users.is_empty());
    assert!(config.database_path().ends_with(".agir/agir.db"));
}

#[test]
fn test_env_vars_expanded_in_config() {
    std::env::set_var("AGIR_TEST_CONFIG_KEY", "sk-from-env");
    let tmp = write_temp_file(
        r#"
[providers.anthropic]
api_key = "${AGIR_TEST_CONFIG_KEY}"
"#,
    );
    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.provider("anthropic").api_key.as_deref(),
        Some("sk-from-env")
    );
}

#[test]
fn test_missing_config_file() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/agir.toml")).unwrap_err();
    assert!(matches!(err, AgirError::ConfigNotFound(_)));

    let config =
        AppConfig::load_or_default(std::path::Path::new("/nonexistent/agir.toml")).unwrap();
    assert_eq!(config.engine.max_steps, 100);
}

#[test]
fn test_malformed_config_is_configuration_error() {
    let tmp = write_temp_file("[engine\nmax_steps = ");
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_load_process_file() {
    let tmp = write_temp_file(CLINIC_YAML);
    let process = ProcessDefinition::load(tmp.path()).expect("load process");

    assert_eq!(process.name(), "Clinic Visit");
    assert_eq!(process.learner().username, "alice");
    assert_eq!(process.learner().model.as_deref(), Some("modelA"));
    assert_eq!(process.nodes().len(), 2);
    assert_eq!(process.start_node().name, "Intro");
    assert_eq!(process.acting_as(process.start_node()), "Doctor");
    assert_eq!(process.evolution().map(|e| e.method.as_str()), Some("reflection"));
}

#[test]
fn test_invalid_process_file_is_validation_error() {
    let tmp = write_temp_file(
        r#"
learner:
  username: alice
roles:
  - id: doctor
nodes:
  - name: Intro
    role: surgeon
"#,
    );
    let err = ProcessDefinition::load(tmp.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("surgeon"));

    let tmp = write_temp_file("nodes: [unclosed");
    let err = ProcessDefinition::load(tmp.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}
