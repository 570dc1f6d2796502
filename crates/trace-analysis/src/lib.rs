//! Graph construction, path search and risk scoring for USDT transfer tracing.
//!
//! An [`Analyzer`] run grows a bounded transfer graph around two endpoints
//! while a bidirectional search looks for connecting paths, then ranks nodes,
//! groups them into communities and scores every path for risk.

pub mod builder;
pub mod community;
pub mod config;
pub mod error;
pub mod features;
pub mod graph;
pub mod node_scorer;
pub mod orchestrator;
pub mod path_finder;
pub mod progress;
pub mod risk;

pub use builder::{GraphBuilder, GraphStatistics};
pub use community::{Community, CommunityDetector, CommunityIndex, CommunityKind, CommunityRisk};
pub use config::{RiskThresholds, RiskWeights, TraceConfig, MAX_HOPS, MIN_HOPS};
pub use error::{Budget, Degradation, TraceError};
pub use features::{AddressActivity, Classification, Classifier, HeuristicClassifier, WalletLabel};
pub use graph::{NodeInfo, NodeState, TransferGraph};
pub use node_scorer::{NodeScore, NodeScorer, NodeScores};
pub use orchestrator::{AnalysisRequest, AnalysisResult, AnalyzedPath, Analyzer, KeyAddress, NodeReport};
pub use path_finder::{find_paths_in, BidirectionalPathFinder, Hop, Path, SearchOutcome, Termination};
pub use progress::{Phase, ProgressEvent, ProgressReporter};
pub use risk::{FiredFactor, RiskAssessment, RiskContext, RiskFactor, RiskLevel, RiskScorer};
