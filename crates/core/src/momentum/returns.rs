use crate::domain::horizon::HorizonMap;
use crate::domain::observation::{ReturnVector, TickerObservation};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReturnError {
    #[error("{field} price is not a finite number: {value}")]
    NonFinitePrice { field: &'static str, value: f64 },

    #[error("return is not finite: current={current}, reference={reference}")]
    NonFiniteReturn { current: f64, reference: f64 },

    #[error("current price must be positive: {value}")]
    NonPositiveCurrent { value: f64 },
}

/// Simple return `current / reference - 1`.
///
/// A missing price on either side, or a zero reference, yields `Ok(None)`: that is missing
/// data, not a failure. Only malformed numbers (NaN or infinite) are errors.
pub fn compute_return(
    current: Option<f64>,
    reference: Option<f64>,
) -> Result<Option<f64>, ReturnError> {
    if let Some(value) = current.filter(|v| !v.is_finite()) {
        return Err(ReturnError::NonFinitePrice {
            field: "current",
            value,
        });
    }
    if let Some(value) = reference.filter(|v| !v.is_finite()) {
        return Err(ReturnError::NonFinitePrice {
            field: "reference",
            value,
        });
    }

    let (Some(current), Some(reference)) = (current, reference) else {
        return Ok(None);
    };
    if reference == 0.0 {
        return Ok(None);
    }

    let r = (current / reference) - 1.0;
    if !r.is_finite() {
        return Err(ReturnError::NonFiniteReturn { current, reference });
    }
    Ok(Some(r))
}

/// Returns for every horizon. A non-positive or malformed current price rejects the ticker.
pub fn return_vector(obs: &TickerObservation) -> Result<ReturnVector, ReturnError> {
    if obs.current_price.is_finite() && obs.current_price <= 0.0 {
        return Err(ReturnError::NonPositiveCurrent {
            value: obs.current_price,
        });
    }

    let mut returns = HorizonMap::<Option<f64>>::default();
    for (h, reference) in obs.reference_prices.iter() {
        returns[h] = compute_return(Some(obs.current_price), *reference)?;
    }

    Ok(ReturnVector {
        ticker: obs.ticker.clone(),
        current_price: obs.current_price,
        returns,
        provenance: obs.provenance,
    })
}
