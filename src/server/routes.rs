//! Allow-list of replayable endpoints and their upstream GitHub calls.

use serde_json::{json, Value};
use thiserror::Error;

use crate::remote::Method;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
  #[error("endpoint not allowed: {method} {endpoint}")]
  NotAllowed { method: Method, endpoint: String },

  #[error("invalid path segment '{0}'")]
  InvalidSegment(String),

  #[error("invalid request body: {0}")]
  InvalidBody(String),
}

/// A call the server is willing to make on the client's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayRoute {
  ListRepositories,
  CreateRepository,
  GetUser,
  ListBranches { owner: String, repo: String },
  CreateBranch { owner: String, repo: String },
  GetContents { owner: String, repo: String, path: String },
  PutContents { owner: String, repo: String, path: String },
  ListPulls { owner: String, repo: String },
  CreatePull { owner: String, repo: String },
}

/// The request to send to the GitHub API.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamCall {
  pub method: Method,
  /// Path relative to the API root, starting with `/`.
  pub path: String,
  pub body: Option<Value>,
}

impl ReplayRoute {
  /// Match a client endpoint against the allow-list.
  ///
  /// The `/api` prefix is optional.
  pub fn resolve(method: Method, endpoint: &str) -> Result<Self, RouteError> {
    let not_allowed = || RouteError::NotAllowed {
      method,
      endpoint: endpoint.to_string(),
    };

    let path = match endpoint.strip_prefix("/api") {
      Some(rest) if rest.starts_with('/') => rest,
      _ => endpoint,
    };
    let segments: Vec<&str> = path
      .strip_prefix('/')
      .ok_or_else(not_allowed)?
      .split('/')
      .collect();

    let route = match (method, segments.as_slice()) {
      (Method::Get, ["repos"]) => ReplayRoute::ListRepositories,
      (Method::Post, ["repos"]) => ReplayRoute::CreateRepository,
      (Method::Get, ["user"]) => ReplayRoute::GetUser,
      (Method::Get, ["repos", owner, repo, "branches"]) => ReplayRoute::ListBranches {
        owner: name_segment(owner)?,
        repo: name_segment(repo)?,
      },
      (Method::Post, ["repos", owner, repo, "branches"]) => ReplayRoute::CreateBranch {
        owner: name_segment(owner)?,
        repo: name_segment(repo)?,
      },
      (Method::Get | Method::Put, ["repos", owner, repo, "contents", rest @ ..]) if !rest.is_empty() => {
        let (owner, repo) = (name_segment(owner)?, name_segment(repo)?);
        let path = content_path(rest)?;
        if method == Method::Get {
          ReplayRoute::GetContents { owner, repo, path }
        } else {
          ReplayRoute::PutContents { owner, repo, path }
        }
      }
      (Method::Get, ["repos", owner, repo, "pulls"]) => ReplayRoute::ListPulls {
        owner: name_segment(owner)?,
        repo: name_segment(repo)?,
      },
      (Method::Post, ["repos", owner, repo, "pulls"]) => ReplayRoute::CreatePull {
        owner: name_segment(owner)?,
        repo: name_segment(repo)?,
      },
      _ => return Err(not_allowed()),
    };
    Ok(route)
  }

  /// Build the GitHub call, validating the body where the route takes one.
  pub fn upstream(&self, body: Option<Value>) -> Result<UpstreamCall, RouteError> {
    let call = match self {
      ReplayRoute::ListRepositories => get("/user/repos?per_page=100&sort=updated".to_string()),
      ReplayRoute::GetUser => get("/user".to_string()),
      ReplayRoute::CreateRepository => {
        let body = object_with(body, &["name"])?;
        send(Method::Post, "/user/repos".to_string(), body)
      }
      ReplayRoute::ListBranches { owner, repo } => {
        get(format!("/repos/{}/{}/branches", owner, repo))
      }
      ReplayRoute::CreateBranch { owner, repo } => {
        let body = object_with(body, &["name", "sha"])?;
        send(
          Method::Post,
          format!("/repos/{}/{}/git/refs", owner, repo),
          json!({
            "ref": format!("refs/heads/{}", body["name"].as_str().unwrap_or_default()),
            "sha": body["sha"],
          }),
        )
      }
      ReplayRoute::GetContents { owner, repo, path } => {
        get(format!("/repos/{}/{}/contents/{}", owner, repo, path))
      }
      ReplayRoute::PutContents { owner, repo, path } => {
        let body = object_with(body, &["message", "content"])?;
        send(
          Method::Put,
          format!("/repos/{}/{}/contents/{}", owner, repo, path),
          body,
        )
      }
      ReplayRoute::ListPulls { owner, repo } => get(format!("/repos/{}/{}/pulls", owner, repo)),
      ReplayRoute::CreatePull { owner, repo } => {
        let body = object_with(body, &["title", "head", "base"])?;
        send(Method::Post, format!("/repos/{}/{}/pulls", owner, repo), body)
      }
    };
    Ok(call)
  }
}

fn get(path: String) -> UpstreamCall {
  UpstreamCall {
    method: Method::Get,
    path,
    body: None,
  }
}

fn send(method: Method, path: String, body: Value) -> UpstreamCall {
  UpstreamCall {
    method,
    path,
    body: Some(body),
  }
}

/// Owner and repository names.
fn name_segment(segment: &str) -> Result<String, RouteError> {
  let valid = !segment.is_empty()
    && segment != "."
    && segment != ".."
    && segment
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
  if valid {
    Ok(segment.to_string())
  } else {
    Err(RouteError::InvalidSegment(segment.to_string()))
  }
}

fn content_path(segments: &[&str]) -> Result<String, RouteError> {
  for segment in segments {
    let valid = !segment.is_empty()
      && *segment != "."
      && *segment != ".."
      && !segment
        .chars()
        .any(|c| c.is_control() || matches!(c, '\\' | '%' | '?' | '#'));
    if !valid {
      return Err(RouteError::InvalidSegment(segment.to_string()));
    }
  }
  Ok(segments.join("/"))
}

/// The body as a JSON object carrying non-empty string `fields`.
fn object_with(body: Option<Value>, fields: &[&str]) -> Result<Value, RouteError> {
  let body = body.ok_or_else(|| RouteError::InvalidBody("missing body".to_string()))?;
  if !body.is_object() {
    return Err(RouteError::InvalidBody("body must be an object".to_string()));
  }
  for field in fields {
    match body.get(*field).and_then(Value::as_str) {
      Some(value) if !value.is_empty() => {}
      _ => {
        return Err(RouteError::InvalidBody(format!(
          "'{}' must be a non-empty string",
          field
        )))
      }
    }
  }
  Ok(body)
}
