// WGS-84 coordinate handling shared by the store, the HTTP surface and the
// noise mechanism.

use crate::error::ApiError;

/// Mean earth radius in km (IUGG).
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Kilometers per degree of latitude. Longitude shrinks with cos(lat).
pub const KM_PER_DEG_LAT: f64 = 111.32;

/// Great-circle distance in km between two (lat, lon) points.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Range check for a WGS-84 point: lat in [-90, 90], lon in [-180, 180].
pub fn validate_coordinates(lat: f64, lon: f64) -> Result<(), ApiError> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(ApiError::Validation(format!("latitude {lat} out of range")));
    }
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(ApiError::Validation(format!("longitude {lon} out of range")));
    }
    Ok(())
}
