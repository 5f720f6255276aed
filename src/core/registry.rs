use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
};

use futures::{StreamExt, stream::FuturesUnordered};
use itertools::Itertools;
use tokio::fs;

use crate::{
    constants::{CUSTOM_CHECKER_FILE, DEFAULT_CHECKER_FILE},
    core::domain::TestCase,
};

const INPUT_EXT: &str = "in";
const ANSWER_EXTS: [&str; 2] = ["out", "ans"];

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("default checker {0} is not a regular file")]
    MissingDefaultChecker(PathBuf),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("problem {problem}: case {case} has both .out and .ans answers")]
    AmbiguousAnswer { problem: String, case: String },
    #[error("problem {problem}: case {case} has no .out or .ans answer")]
    MissingAnswer { problem: String, case: String },
    #[error("problem {0} has no test cases")]
    NoTestCases(String),
    #[error("scan of problem {problem} failed: {source}")]
    Join {
        problem: String,
        #[source]
        source: tokio::task::JoinError,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Problem {
    pub cases: Vec<TestCase>,
    pub custom_checker: Option<PathBuf>,
}

/// Test cases and checkers of every problem under the data directory.
/// Built once at startup and read-only afterwards.
#[derive(Debug)]
pub struct Registry {
    data_dir: PathBuf,
    problems: HashMap<String, Problem>,
}

impl Registry {
    #[tracing::instrument(skip_all, fields(data_dir = %data_dir.as_ref().display()))]
    pub async fn build(data_dir: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let data_dir = data_dir.as_ref().to_path_buf();

        let default_checker = data_dir.join(DEFAULT_CHECKER_FILE);
        if !is_regular_file(&default_checker).await {
            return Err(RegistryError::MissingDefaultChecker(default_checker));
        }

        let mut scans = FuturesUnordered::new();
        let mut entries = read_dir(&data_dir).await?;
        while let Some(entry) = next_entry(&data_dir, &mut entries).await? {
            let path = entry.path();
            if !fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
                continue;
            }
            let Ok(problem) = entry.file_name().into_string() else {
                tracing::warn!("Skipping problem dir with non UTF-8 name: {}", path.display());
                continue;
            };

            scans.push(async move {
                let scanned = tokio::spawn(scan_problem(problem.clone(), path)).await;
                (problem, scanned)
            });
        }

        let mut problems = HashMap::new();
        while let Some((problem, scanned)) = scans.next().await {
            let scanned = scanned.map_err(|source| RegistryError::Join {
                problem: problem.clone(),
                source,
            })??;
            tracing::debug!("Problem {}: {} cases", problem, scanned.cases.len());
            problems.insert(problem, scanned);
        }

        tracing::info!("Loaded {} problems", problems.len());
        Ok(Registry { data_dir, problems })
    }

    /// Test cases of `problem_id` in lexicographic order of their names.
    pub fn lookup(&self, problem_id: &str) -> Option<&[TestCase]> {
        self.problems.get(problem_id).map(|p| p.cases.as_slice())
    }

    pub fn has_custom_checker(&self, problem_id: &str) -> bool {
        self.custom_checker(problem_id).is_some()
    }

    pub fn custom_checker(&self, problem_id: &str) -> Option<&Path> {
        self.problems
            .get(problem_id)
            .and_then(|p| p.custom_checker.as_deref())
    }

    pub fn default_checker(&self) -> PathBuf {
        self.data_dir.join(DEFAULT_CHECKER_FILE)
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }
}

async fn scan_problem(problem: String, dir: PathBuf) -> Result<Problem, RegistryError> {
    let mut files = HashSet::new();
    let mut entries = read_dir(&dir).await?;
    while let Some(entry) = next_entry(&dir, &mut entries).await? {
        if !is_regular_file(&entry.path()).await {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            files.insert(name);
        }
    }

    let mut cases = Vec::new();
    for input in files.iter().sorted() {
        let Some(case) = input.strip_suffix(&format!(".{}", INPUT_EXT)) else {
            continue;
        };
        let answers = ANSWER_EXTS
            .iter()
            .map(|ext| format!("{}.{}", case, ext))
            .filter(|name| files.contains(name))
            .collect_vec();

        let answer = match answers.as_slice() {
            [answer] => answer,
            [] => {
                return Err(RegistryError::MissingAnswer {
                    problem,
                    case: case.to_string(),
                });
            }
            _ => {
                return Err(RegistryError::AmbiguousAnswer {
                    problem,
                    case: case.to_string(),
                });
            }
        };

        cases.push(TestCase {
            name: case.to_string(),
            input: dir.join(input),
            answer: dir.join(answer),
        });
    }

    if cases.is_empty() {
        return Err(RegistryError::NoTestCases(problem));
    }

    let custom_checker = files
        .contains(CUSTOM_CHECKER_FILE)
        .then(|| dir.join(CUSTOM_CHECKER_FILE));

    Ok(Problem {
        cases,
        custom_checker,
    })
}

async fn is_regular_file(path: &Path) -> bool {
    fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

async fn read_dir(dir: &Path) -> Result<fs::ReadDir, RegistryError> {
    fs::read_dir(dir).await.map_err(|source| RegistryError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

async fn next_entry(
    dir: &Path,
    entries: &mut fs::ReadDir,
) -> Result<Option<fs::DirEntry>, RegistryError> {
    entries
        .next_entry()
        .await
        .map_err(|source| RegistryError::Io {
            path: dir.to_path_buf(),
            source,
        })
}
