use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::BuildError;

/// Extensiones aceptadas para el DEM (GeoTIFF).
pub const DEM_EXTENSIONS: [&str; 2] = ["tif", "tiff"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    /// Sólo radiación solar (diaria + agregados mensuales)
    Sol,
    /// Solar + clima + cálculo EEMT por (año, mes)
    Eemt,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Sol => "sol",
            WorkflowType::Eemt => "eemt",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sol" => Ok(WorkflowType::Sol),
            "eemt" => Ok(WorkflowType::Eemt),
            other => Err(BuildError::invalid(format!(
                "unknown workflow_type '{other}' (expected 'sol' or 'eemt')"
            ))),
        }
    }
}

/// Parámetros de un workflow. Queda congelado dentro del Job al enviarlo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub workflow_type: WorkflowType,

    /// Ruta al DEM en disco (ya subido)
    pub dem_path: String,

    pub start_year: i32,
    pub end_year: i32,

    /// Paso temporal de r.sun en minutos
    pub step: f64,
    /// Turbidez de Linke
    pub linke_value: f64,
    pub albedo_value: f64,
    /// Hilos por tarea diaria
    pub num_threads: u32,
}

impl WorkflowRequest {
    pub const DEFAULT_STEP: f64 = 15.0;
    pub const DEFAULT_LINKE: f64 = 3.0;
    pub const DEFAULT_ALBEDO: f64 = 0.2;
    pub const DEFAULT_THREADS: u32 = 4;
    pub const DEFAULT_YEAR: i32 = 2020;
    /// Años como máximo por pedido (el grafo EEMT crece con cada año)
    pub const MAX_YEARS: i64 = 50;

    pub fn new(workflow_type: WorkflowType, dem_path: impl Into<String>) -> Self {
        Self {
            workflow_type,
            dem_path: dem_path.into(),
            start_year: Self::DEFAULT_YEAR,
            end_year: Self::DEFAULT_YEAR,
            step: Self::DEFAULT_STEP,
            linke_value: Self::DEFAULT_LINKE,
            albedo_value: Self::DEFAULT_ALBEDO,
            num_threads: Self::DEFAULT_THREADS,
        }
    }

    /// Validación de forma, sin tocar el disco.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.end_year < self.start_year {
            return Err(BuildError::invalid(format!(
                "end_year {} is before start_year {}",
                self.end_year, self.start_year
            )));
        }
        let span = i64::from(self.end_year) - i64::from(self.start_year) + 1;
        if span > Self::MAX_YEARS {
            return Err(BuildError::invalid(format!(
                "year range {}-{} spans {} years, at most {} are allowed",
                self.start_year,
                self.end_year,
                span,
                Self::MAX_YEARS
            )));
        }
        if self.dem_path.trim().is_empty() {
            return Err(BuildError::invalid("DEM path is missing"));
        }
        if !has_dem_extension(&self.dem_path) {
            return Err(BuildError::invalid(format!(
                "DEM file must be a GeoTIFF (.tif or .tiff): {}",
                self.dem_path
            )));
        }
        if !(self.step > 0.0) {
            return Err(BuildError::invalid("step must be greater than zero"));
        }
        if self.num_threads == 0 {
            return Err(BuildError::invalid("num_threads must be at least 1"));
        }
        Ok(())
    }

    pub fn years(&self) -> impl Iterator<Item = i32> {
        self.start_year..=self.end_year
    }
}

/// `true` si el nombre termina en .tif/.tiff (sin distinguir mayúsculas).
pub fn has_dem_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| DEM_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rechaza_anios_invertidos() {
        let mut req = WorkflowRequest::new(WorkflowType::Eemt, "dem.tif");
        req.start_year = 2021;
        req.end_year = 2020;
        assert!(matches!(req.validate(), Err(BuildError::InvalidRequest(_))));
    }

    #[test]
    fn validate_acota_el_rango_de_anios() {
        let mut req = WorkflowRequest::new(WorkflowType::Eemt, "dem.tif");
        req.start_year = 1;
        req.end_year = 100_000;
        assert!(matches!(req.validate(), Err(BuildError::InvalidRequest(_))));

        req.start_year = i32::MIN;
        req.end_year = i32::MAX;
        assert!(req.validate().is_err());

        req.start_year = 1980;
        req.end_year = 1980 + WorkflowRequest::MAX_YEARS as i32 - 1;
        assert!(req.validate().is_ok());
    }

    #[test]
    fn validate_rechaza_dem_vacio_o_con_otra_extension() {
        let req = WorkflowRequest::new(WorkflowType::Sol, "  ");
        assert!(req.validate().is_err());

        let req = WorkflowRequest::new(WorkflowType::Sol, "dem.png");
        assert!(req.validate().is_err());

        let req = WorkflowRequest::new(WorkflowType::Sol, "uploads/x_DEM.TIFF");
        assert!(req.validate().is_ok());
    }

    #[test]
    fn workflow_type_parsea_sol_y_eemt() {
        assert_eq!("sol".parse::<WorkflowType>().unwrap(), WorkflowType::Sol);
        assert_eq!(" EEMT ".parse::<WorkflowType>().unwrap(), WorkflowType::Eemt);
        assert!("solar".parse::<WorkflowType>().is_err());
    }
}
