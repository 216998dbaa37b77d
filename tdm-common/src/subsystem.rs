//! Registry of learning subsystems that persist state through TDM
//!
//! Subsystem names are stable logical identities. The completion tracker only
//! tracks the names listed in [`KNOWN_SUBSYSTEMS`]; other names (model-specific
//! aliases such as `DQN_Target`) are accepted everywhere else.

/// The learning subsystems whose activity is tracked for quiescence
pub const KNOWN_SUBSYSTEMS: [&str; 11] = [
    "QLearning",
    "AlphaFold3",
    "DeepQNetwork",
    "GeneticAlgorithm",
    "AlphaZero",
    "LeelaChessZero",
    "MonteCarloTreeSearch",
    "Negamax",
    "OpenAI",
    "DeepLearning",
    "DeepLearningCNN",
];

/// Default file name for a subsystem that saves a single file
pub fn default_file_name(name: &str) -> String {
    format!("{}.dat", name)
}

/// Configuration key for a subsystem's feature flags
///
/// Several subsystems save under more than one name (policy/value networks,
/// target networks, experience buffers). All aliases of one subsystem share a
/// single key so they are switched together.
pub fn feature_key(name: &str) -> String {
    let key = match name {
        "QLearning" => "qlearning",
        "GeneticAlgorithm" | "Genetic" => "genetic",
        "AlphaFold3" => "alphafold3",
        "DeepQNetwork" | "DQN" | "DQN_Main" | "DQN_Target" | "DQN_Experiences" => "dqn",
        "DeepLearning" => "deeplearning",
        "DeepLearningCNN" | "CNN" => "cnn",
        "AlphaZero" | "AlphaZero-Policy" | "AlphaZero-Value" => "alphazero",
        "LeelaChessZero" | "LeelaZero" | "LeelaZero-Policy" | "LeelaZero-Value" => "leela",
        "MonteCarloTreeSearch" | "MCTS" => "mcts",
        "AsynchronousAdvantageActorCritic" | "A3C" => "a3c",
        other => {
            return other
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_lowercase())
                .collect()
        }
    };
    key.to_string()
}
