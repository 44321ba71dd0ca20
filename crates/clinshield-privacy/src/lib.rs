pub mod adjustment;
pub mod categorical;
pub mod dates;
pub mod mechanisms;
pub mod metrics;
pub mod numeric;
pub mod report;

pub use adjustment::{MomentumController, NoiseParameters, EPSILON_CEILING, EPSILON_FLOOR};
pub use categorical::{
    calibrate_resources, AttributeCalibration, CategoricalCalibrator, PassOutcome,
    DUMMY_RESET_EPSILON, DUMMY_THRESHOLD,
};
pub use dates::{generalize_text, DatePrecision, DateValue};
pub use mechanisms::{exponential_select, gaussian, gaussian_sigma, laplace, laplace_noise};
pub use metrics::{rmse_by_attribute, rmse_dates, rmse_decimals, total_variation_distance};
pub use numeric::{calibrate_batches, generalize_batch, NumericCalibrator};
pub use report::{AttributeOutcome, CategoricalReport, NumericReport};
