//! Request pipeline: the one primitive everything reduces to is "send one
//! request with the target parameter replaced by a raw string" while
//! holding a semaphore permit. Timing uses the monotonic clock and the
//! body read completes before the timer is released.

use crate::context::{AttackContext, Encoding, RequestArgs};
use crate::error::{Error, Result};
use crate::xpath::Expression;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A fully read response with its elapsed wall time
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    pub elapsed: Duration,
}

fn build_args(
    context: &AttackContext,
    raw_value: &str,
    overrides: Option<&[(String, String)]>,
) -> RequestArgs {
    let mut params = context.parameters.clone();
    for (key, value) in params.iter_mut() {
        if key == &context.target_parameter {
            *value = raw_value.to_string();
        }
    }
    if let Some(overrides) = overrides {
        for (key, value) in overrides {
            match params.iter_mut().find(|(k, _)| k == key) {
                Some((_, existing)) => *existing = value.clone(),
                None => params.push((key.clone(), value.clone())),
            }
        }
    }

    let body = match context.encoding {
        Encoding::Url => context.body.clone(),
        Encoding::Form => None,
    };
    RequestArgs { params, body }
}

async fn attempt(context: &AttackContext, args: &RequestArgs) -> Result<RawResponse> {
    let client = context.session()?;
    let method = reqwest::Method::from_bytes(context.method.as_bytes())
        .map_err(|_| Error::Method(context.method.clone()))?;

    let mut request = client.request(method, &context.url);
    match context.encoding {
        Encoding::Url => {
            request = request.query(&args.params);
            if let Some(body) = &args.body {
                request = request.body(body.clone());
            }
        }
        Encoding::Form => {
            request = request.form(&args.params);
        }
    }

    let started = Instant::now();
    let response = request.send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    Ok(RawResponse {
        status,
        body,
        elapsed: started.elapsed(),
    })
}

/// Send one request. Transport failures get one transparent retry with the
/// same arguments; the second failure propagates and oracle callers treat
/// it as a false answer (under-reporting is recoverable, a corrupted
/// extraction is not).
pub async fn send_with_value(
    context: &AttackContext,
    raw_value: &str,
    overrides: Option<&[(String, String)]>,
) -> Result<RawResponse> {
    let mut args = build_args(context, raw_value, overrides);
    if let Some(tamper) = &context.tamper {
        tamper.tamper(context, &mut args).await?;
    }

    let semaphore = context.semaphore()?.clone();
    let _permit = semaphore
        .acquire()
        .await
        .map_err(|_| Error::NoSession)?;

    match attempt(context, &args).await {
        Ok(response) => Ok(response),
        Err(Error::Reqwest(first)) => {
            warn!(error = %first, "request failed, retrying once");
            match attempt(context, &args).await {
                Ok(response) => Ok(response),
                Err(Error::Reqwest(second)) => Err(Error::Transport(second)),
                Err(other) => Err(other),
            }
        }
        Err(other) => Err(other),
    }
}

/// Render the oracle payload for `expression` through the selected
/// injection, if any. In time-based mode the probe is combined with the
/// delay expression by literal concatenation, matching the wire form the
/// timing calibration was performed against; a probe containing a bare
/// `or` is flagged because `and` binds tighter and the association may
/// not be the intended one.
fn render_payload(context: &AttackContext, expression: &str) -> Result<String> {
    match &context.injection {
        Some(injection) => {
            let expr = if context.time_based {
                let delay = context.time_delay_expr.as_deref().unwrap_or_default();
                if expression.contains(" or ") {
                    warn!(
                        probe = expression,
                        "probe contains 'or'; the appended delay binds tighter and may \
                         not gate the whole probe"
                    );
                }
                Expression::raw(format!("{} and {}", expression, delay))
            } else {
                Expression::raw(expression)
            };
            injection.render_expression(context.target_parameter_value(), &expr)
        }
        None => Ok(expression.to_string()),
    }
}

/// The boolean oracle. With an injection selected, `expression` is an
/// XPath boolean probe to embed; without one (during detection) it is the
/// complete raw payload. Transport failure after retry is a false answer.
pub async fn check(context: &AttackContext, expression: &str) -> Result<bool> {
    let payload = render_payload(context, expression)?;
    debug!(payload = %payload, "oracle probe");

    let response = match send_with_value(context, &payload, None).await {
        Ok(response) => response,
        Err(Error::Transport(error)) => {
            warn!(error = %error, "treating failed request as a false oracle answer");
            return Ok(false);
        }
        Err(other) => return Err(other),
    };

    if context.time_based {
        Ok(response.elapsed.as_secs_f64() >= context.time_threshold)
    } else {
        Ok((context.match_fn)(response.status, &response.body))
    }
}

/// Send `raw_value` as-is and return the elapsed time in seconds. Used by
/// timed injection detection, where the caller renders payloads itself.
pub async fn timed_request(context: &AttackContext, raw_value: &str) -> Result<f64> {
    let response = send_with_value(context, raw_value, None).await?;
    Ok(response.elapsed.as_secs_f64())
}

/// Send `raw_value` and return `(body, match verdict)`. The in-band
/// extractor needs both: the verdict decides whether a probed path exists,
/// the body feeds the response diff.
pub async fn get_response_with_match(
    context: &AttackContext,
    raw_value: &str,
    overrides: Option<&[(String, String)]>,
) -> Result<(String, bool)> {
    let response = send_with_value(context, raw_value, overrides).await?;
    let verdict = (context.match_fn)(response.status, &response.body);
    Ok((response.body, verdict))
}

/// Send `raw_value` and return just the response body
pub async fn get_response_body(
    context: &AttackContext,
    raw_value: &str,
    overrides: Option<&[(String, String)]>,
) -> Result<String> {
    let (body, _) = get_response_with_match(context, raw_value, overrides).await?;
    Ok(body)
}
