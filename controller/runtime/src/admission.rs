use super::validation::{self, NormalizedMacs};
use crate::k8s::{Rule, RuleSpec};
use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::{
    core::{admission::Operation, DynamicObject},
    Resource, ResourceExt,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Clone, Debug, Default)]
pub struct Admission {}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            let bytes = req.into_body().collect().await?.to_bytes();
            json_response(admission.review(&bytes))
        })
    }
}

impl Admission {
    pub fn new() -> Self {
        Self {}
    }

    /// Handles a serialized `AdmissionReview`.
    fn review(&self, body: &[u8]) -> AdmissionReview {
        let review: Review = match serde_json::from_slice(body) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "Failed to parse request body");
                return AdmissionResponse::invalid(error).into_review();
            }
        };
        trace!(?review);

        let rsp = match review.try_into() {
            Ok(req) => {
                debug!(?req);
                self.admit(req)
            }
            Err(error) => {
                warn!(%error, "Invalid admission request");
                AdmissionResponse::invalid(error)
            }
        };
        debug!(?rsp);
        rsp.into_review()
    }

    fn admit(&self, req: AdmissionRequest) -> AdmissionResponse {
        if is_kind::<Rule>(&req) {
            return self.admit_rule(req);
        }

        AdmissionResponse::invalid(format_args!(
            "unsupported resource type: {}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        ))
    }

    /// Validates a rule, lowercasing its MACs if necessary.
    fn admit_rule(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        if req.operation == Operation::Delete {
            return rsp;
        }

        let (obj, mut spec) = match parse_spec::<RuleSpec>(req) {
            Ok(spec) => spec,
            Err(error) => {
                info!(%error, "Failed to parse Rule spec");
                return rsp.deny(error);
            }
        };
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();

        let normalized = validation::normalize_macs(&mut spec);
        if let Err(error) = validation::validate_rule(&spec) {
            info!(%error, %ns, %name, "Denied");
            return rsp.deny(error);
        }

        let patch = match mac_patch(normalized) {
            Some(patch) => patch,
            None => return rsp,
        };
        debug!(%ns, %name, "Lowercasing rule MACs");
        match rsp.clone().with_patch(patch) {
            Ok(rsp) => rsp,
            Err(error) => {
                warn!(%error, %ns, %name, "Failed to encode patch");
                rsp.deny(error)
            }
        }
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn parse_spec<T: serde::de::DeserializeOwned>(
    req: AdmissionRequest,
) -> Result<(DynamicObject, T)> {
    let obj = req
        .object
        .ok_or_else(|| anyhow!("admission request missing 'object"))?;

    let spec = {
        let data = obj
            .data
            .get("spec")
            .cloned()
            .ok_or_else(|| anyhow!("admission request missing 'spec'"))?;
        serde_json::from_value(data)?
    };

    Ok((obj, spec))
}

/// Builds a JSON patch that replaces the MACs that were lowercased.
fn mac_patch(NormalizedMacs { src_mac, dst_mac }: NormalizedMacs) -> Option<json_patch::Patch> {
    let ops = [("/spec/match/srcMac", src_mac), ("/spec/match/dstMac", dst_mac)]
        .into_iter()
        .filter_map(|(path, mac)| {
            mac.map(|mac| json!({ "op": "replace", "path": path, "value": mac }))
        })
        .collect::<Vec<_>>();
    if ops.is_empty() {
        return None;
    }
    serde_json::from_value(serde_json::Value::Array(ops)).ok()
}
