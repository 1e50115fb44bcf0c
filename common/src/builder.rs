//! Construcción del grafo de tareas a partir de un [`WorkflowRequest`].
//!
//! Es una función pura: lo único que mira del disco es si el DEM existe.
//! Las dependencias salen solas de las rutas declaradas, el builder sólo
//! agrega registros de tareas a una lista y al final arma el [`TaskGraph`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::dag::TaskGraph;
use crate::error::BuildError;
use crate::task::{ResourceSpec, Task, TaskCategory};
use crate::workflow::{WorkflowRequest, WorkflowType};

/// Días del año que se simulan. Los años bisiestos también usan 365.
pub const DAYS_PER_YEAR: u32 = 365;

/// Rangos fijos (día inicial, día final) del año juliano por mes.
pub const MONTH_DAY_RANGES: [(u32, u32); 12] = [
    (1, 31),
    (32, 59),
    (60, 90),
    (91, 120),
    (121, 151),
    (152, 181),
    (182, 212),
    (213, 243),
    (244, 273),
    (274, 304),
    (305, 334),
    (335, 365),
];

/// Variables de Daymet que necesita cada mes de EEMT.
pub const CLIMATE_VARIABLES: [&str; 4] = ["tmin", "tmax", "prcp", "vp"];

pub const DEFAULT_PROCESSOR: &str = "eemt-raster";

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Directorio de resultados del job (`results/<job_id>`)
    pub output_root: PathBuf,
    /// Ejecutable del procesador raster externo
    pub processor: String,
}

impl BuildOptions {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            processor: DEFAULT_PROCESSOR.to_string(),
        }
    }
}

/// Salidas mensuales de la parte solar, en el orden en que las consume EEMT.
#[derive(Debug, Clone)]
struct MonthlySolar {
    global_sum: String,
    flat_sum: String,
    hours_average: String,
}

/// Construye el grafo de tareas del pedido.
///
/// Falla con [`BuildError::InvalidRequest`] si el pedido no valida o si el
/// DEM no existe.
pub fn build(req: &WorkflowRequest, opts: &BuildOptions) -> Result<TaskGraph, BuildError> {
    req.validate()?;
    if !Path::new(&req.dem_path).exists() {
        return Err(BuildError::invalid(format!("DEM not found: {}", req.dem_path)));
    }

    let mut b = GraphBuilder::new(req, opts);
    let monthly = b.solar();
    if req.workflow_type == WorkflowType::Eemt {
        b.eemt(&monthly);
    }

    let graph = TaskGraph::from_tasks(b.tasks)?;
    graph.check_inputs(|p| p == req.dem_path)?;
    Ok(graph)
}

/// Día del año -> mes (1..=12) usando los rangos fijos.
pub fn month_of_day(day: u32) -> Option<u32> {
    MONTH_DAY_RANGES
        .iter()
        .position(|(first, last)| (*first..=*last).contains(&day))
        .map(|i| i as u32 + 1)
}

struct GraphBuilder<'a> {
    req: &'a WorkflowRequest,
    opts: &'a BuildOptions,
    tasks: Vec<Task>,
}

impl<'a> GraphBuilder<'a> {
    fn new(req: &'a WorkflowRequest, opts: &'a BuildOptions) -> Self {
        Self {
            req,
            opts,
            tasks: Vec::new(),
        }
    }

    fn path(&self, rel: String) -> String {
        self.opts.output_root.join(rel).to_string_lossy().into_owned()
    }

    fn push(
        &mut self,
        id: String,
        category: TaskCategory,
        params: BTreeMap<String, String>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) {
        let command = render_command(&self.opts.processor, category, &params, &inputs, &outputs);
        let resources = resources_for(category, self.req.num_threads);
        self.tasks.push(Task {
            id,
            category,
            command,
            params,
            inputs,
            outputs,
            resources,
        });
    }

    /// 365 tareas diarias + 12 agregados mensuales.
    fn solar(&mut self) -> Vec<MonthlySolar> {
        let mut daily: Vec<[String; 3]> = Vec::with_capacity(DAYS_PER_YEAR as usize);

        for day in 1..=DAYS_PER_YEAR {
            let outputs = [
                self.path(format!("global/daily/total_sun_day_{day:03}.tif")),
                self.path(format!("global/daily/flat_total_sun_day_{day:03}.tif")),
                self.path(format!("insol/daily/hours_sun_day_{day:03}.tif")),
            ];

            let mut params = BTreeMap::new();
            params.insert("day".to_string(), day.to_string());
            params.insert("step".to_string(), self.req.step.to_string());
            params.insert("linke_value".to_string(), self.req.linke_value.to_string());
            params.insert("albedo_value".to_string(), self.req.albedo_value.to_string());
            params.insert("num_threads".to_string(), self.req.num_threads.to_string());

            self.push(
                format!("sol-day-{day:03}"),
                TaskCategory::SolarDay,
                params,
                vec![self.req.dem_path.clone()],
                outputs.to_vec(),
            );
            daily.push(outputs);
        }

        let mut monthly = Vec::with_capacity(12);
        for (i, (first, last)) in MONTH_DAY_RANGES.iter().enumerate() {
            let month = i as u32 + 1;
            let inputs: Vec<String> = (*first..=*last)
                .flat_map(|day| daily[(day - 1) as usize].iter().cloned())
                .collect();

            let sums = MonthlySolar {
                global_sum: self.path(format!("global/monthly/total_sun_{month:02}_sum.tif")),
                flat_sum: self.path(format!("global/monthly/flat_total_sun_{month:02}_sum.tif")),
                hours_average: self.path(format!("insol/monthly/hours_sun_{month:02}_average.tif")),
            };

            let mut params = BTreeMap::new();
            params.insert("month".to_string(), month.to_string());
            params.insert("first_day".to_string(), first.to_string());
            params.insert("last_day".to_string(), last.to_string());

            self.push(
                format!("sol-month-{month:02}"),
                TaskCategory::MonthlyAggregate,
                params,
                inputs,
                vec![
                    sums.global_sum.clone(),
                    sums.flat_sum.clone(),
                    sums.hours_average.clone(),
                ],
            );
            monthly.push(sums);
        }

        monthly
    }

    /// Capas topográficas + clima + EEMT por cada (año, mes).
    fn eemt(&mut self, monthly: &[MonthlySolar]) {
        let slope = self.path("eemt/static/slope.tif".to_string());
        let aspect = self.path("eemt/static/aspect.tif".to_string());
        let twi = self.path("eemt/static/twi.tif".to_string());

        self.push(
            "topo-prep".to_string(),
            TaskCategory::TopoPrep,
            BTreeMap::new(),
            vec![self.req.dem_path.clone()],
            vec![slope.clone(), aspect.clone(), twi.clone()],
        );

        for year in self.req.years() {
            for (i, solar) in monthly.iter().enumerate() {
                let month = i as u32 + 1;

                let mut climate = Vec::with_capacity(CLIMATE_VARIABLES.len());
                for var in CLIMATE_VARIABLES {
                    let out =
                        self.path(format!("eemt/climate/{year}/daymet_{var}_{year}_{month:02}.tif"));

                    let mut params = BTreeMap::new();
                    params.insert("variable".to_string(), var.to_string());
                    params.insert("year".to_string(), year.to_string());
                    params.insert("month".to_string(), month.to_string());

                    self.push(
                        format!("climate-{var}-{year}-{month:02}"),
                        TaskCategory::ClimateFetch,
                        params,
                        vec![self.req.dem_path.clone()],
                        vec![out.clone()],
                    );
                    climate.push(out);
                }

                let mut inputs = vec![
                    self.req.dem_path.clone(),
                    twi.clone(),
                    slope.clone(),
                    aspect.clone(),
                    solar.global_sum.clone(),
                    solar.flat_sum.clone(),
                    solar.hours_average.clone(),
                ];
                inputs.extend(climate);

                let mut params = BTreeMap::new();
                params.insert("year".to_string(), year.to_string());
                params.insert("month".to_string(), month.to_string());

                self.push(
                    format!("eemt-{year}-{month:02}"),
                    TaskCategory::EemtCalc,
                    params,
                    inputs,
                    vec![self.path(format!("eemt/{year}/eemt_{year}_{month:02}.tif"))],
                );
            }
        }
    }
}

fn resources_for(category: TaskCategory, threads: u32) -> ResourceSpec {
    match category {
        TaskCategory::SolarDay => ResourceSpec::new(threads, 1024, 512),
        TaskCategory::MonthlyAggregate => ResourceSpec::new(1, 2048, 1024),
        TaskCategory::TopoPrep => ResourceSpec::new(1, 2048, 1024),
        TaskCategory::ClimateFetch => ResourceSpec::new(1, 512, 1024),
        TaskCategory::EemtCalc => ResourceSpec::new(1, 2048, 1024),
    }
}

/// `<proc> <categoria> --k=v ... -i entrada ... -o salida ...`
fn render_command(
    processor: &str,
    category: TaskCategory,
    params: &BTreeMap<String, String>,
    inputs: &[String],
    outputs: &[String],
) -> String {
    let mut parts = vec![processor.to_string(), category.as_str().to_string()];
    parts.extend(params.iter().map(|(k, v)| format!("--{k}={v}")));
    for input in inputs {
        parts.push("-i".to_string());
        parts.push(input.clone());
    }
    for output in outputs {
        parts.push("-o".to_string());
        parts.push(output.clone());
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn fixture(workflow_type: WorkflowType) -> (TempDir, WorkflowRequest, BuildOptions) {
        let dir = tempfile::tempdir().unwrap();
        let dem = dir.path().join("job_dem.tif");
        std::fs::write(&dem, b"II*\0").unwrap();

        let req = WorkflowRequest::new(workflow_type, dem.to_string_lossy().into_owned());
        let opts = BuildOptions::new(dir.path().join("results").join("job"));
        (dir, req, opts)
    }

    #[test]
    fn build_sol_genera_365_diarias_y_12_mensuales() {
        let (_dir, req, opts) = fixture(WorkflowType::Sol);
        let g = build(&req, &opts).unwrap();

        let daily = g.tasks.iter().filter(|t| t.category == TaskCategory::SolarDay).count();
        let monthly = g
            .tasks
            .iter()
            .filter(|t| t.category == TaskCategory::MonthlyAggregate)
            .count();
        assert_eq!(daily, 365);
        assert_eq!(monthly, 12);
        assert_eq!(g.len(), 377);
        assert!(g.tasks.iter().all(|t| t.outputs.len() == 3));
    }

    #[test]
    fn tarea_mensual_consume_exactamente_los_dias_de_su_mes() {
        let (_dir, req, opts) = fixture(WorkflowType::Sol);
        let g = build(&req, &opts).unwrap();

        for (i, (first, last)) in MONTH_DAY_RANGES.iter().enumerate() {
            let month = g.index_of(&format!("sol-month-{:02}", i + 1)).unwrap();

            let expected: HashSet<String> = (*first..=*last)
                .flat_map(|d| {
                    let day = g.index_of(&format!("sol-day-{d:03}")).unwrap();
                    g.tasks[day].outputs.clone()
                })
                .collect();
            let actual: HashSet<String> = g.tasks[month].inputs.iter().cloned().collect();

            assert_eq!(actual, expected, "mes {}", i + 1);
            assert_eq!(g.producers_of(month).len(), (last - first + 1) as usize);
        }
    }

    #[test]
    fn rangos_mensuales_cubren_365_dias_sin_huecos() {
        let mut next = 1;
        for (first, last) in MONTH_DAY_RANGES {
            assert_eq!(first, next);
            next = last + 1;
        }
        assert_eq!(next, DAYS_PER_YEAR + 1);
        assert_eq!(month_of_day(59), Some(2));
        assert_eq!(month_of_day(365), Some(12));
        assert_eq!(month_of_day(366), None);
    }

    #[test]
    fn build_eemt_agrega_clima_y_calculo_por_anio_y_mes() {
        let (_dir, mut req, opts) = fixture(WorkflowType::Eemt);
        req.start_year = 2019;
        req.end_year = 2020;
        let g = build(&req, &opts).unwrap();

        let count = |c: TaskCategory| g.tasks.iter().filter(|t| t.category == c).count();
        assert_eq!(count(TaskCategory::ClimateFetch), 2 * 12 * 4);
        assert_eq!(count(TaskCategory::EemtCalc), 2 * 12);
        assert_eq!(count(TaskCategory::TopoPrep), 1);
        assert_eq!(g.len(), 377 + 1 + 2 * 12 * 5);

        let eemt = g.index_of("eemt-2020-03").unwrap();
        let producers: HashSet<String> = g
            .producers_of(eemt)
            .into_iter()
            .map(|i| g.tasks[i].id.clone())
            .collect();
        let expected: HashSet<String> = [
            "sol-month-03",
            "topo-prep",
            "climate-tmin-2020-03",
            "climate-tmax-2020-03",
            "climate-prcp-2020-03",
            "climate-vp-2020-03",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(producers, expected);
        assert!(g.tasks[eemt].inputs.contains(&req.dem_path));
    }

    #[test]
    fn grafo_es_aciclico_y_con_entradas_resueltas() {
        let (_dir, req, opts) = fixture(WorkflowType::Eemt);
        let g = build(&req, &opts).unwrap();

        let order = g.topological_order().unwrap();
        assert_eq!(order.len(), g.len());
        assert_eq!(
            g.external_inputs().into_iter().collect::<Vec<_>>(),
            vec![req.dem_path.clone()]
        );
    }

    #[test]
    fn build_es_determinista() {
        let (_dir, req, opts) = fixture(WorkflowType::Eemt);
        let a = build(&req, &opts).unwrap();
        let b = build(&req, &opts).unwrap();
        assert_eq!(a.tasks, b.tasks);
        assert_eq!(a.edges, b.edges);
        assert_eq!(a.to_makeflow(), b.to_makeflow());
    }

    #[test]
    fn build_falla_con_dem_inexistente_o_anios_invertidos() {
        let (_dir, mut req, opts) = fixture(WorkflowType::Eemt);
        req.end_year = req.start_year - 1;
        assert!(matches!(build(&req, &opts), Err(BuildError::InvalidRequest(_))));

        let req = WorkflowRequest::new(WorkflowType::Sol, "/no/existe/dem.tif");
        let err = build(&req, &opts).unwrap_err();
        assert!(err.to_string().contains("DEM not found"));
    }

    #[test]
    fn comando_lleva_parametros_y_rutas() {
        let (_dir, req, opts) = fixture(WorkflowType::Sol);
        let g = build(&req, &opts).unwrap();
        let day = &g.tasks[g.index_of("sol-day-032").unwrap()];

        assert!(day.command.starts_with("eemt-raster solar-day "));
        assert!(day.command.contains("--day=32"));
        assert!(day.command.contains(&format!("-i {}", req.dem_path)));
        assert_eq!(day.resources.cores, req.num_threads);
    }
}
