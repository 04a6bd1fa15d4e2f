//! Pads the stitched image onto an exact 2:1 canvas, image anchored at the
//! bottom so the empty band on top is the sky.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::pipeline::runtime::PipelineCommandRunner;
use crate::pipeline::stages::{
    skipped_report, StageArg, StageDescriptor, StageError, StageExecutor, StagePrecondition,
    StageReport,
};
use crate::pipeline::tools::ToolKind;

pub const RESIZED_FILE: &str = "resized.jpg";
const STAGE: &str = "resize";

/// ImageMagick computes the same canvas itself when we cannot read the header.
const FX_GEOMETRY: &str = "%[fx:2*max(ceil(w/2),h)]x%[fx:max(ceil(w/2),h)]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Geometry {
    Exact { width: u32, height: u32 },
    Computed,
}

impl Geometry {
    pub fn extent_arg(self) -> String {
        match self {
            Self::Exact { width, height } => format!("{width}x{height}"),
            Self::Computed => FX_GEOMETRY.to_string(),
        }
    }
}

/// Smallest 2:1 canvas that contains a `width` x `height` image.
pub fn equirect_extent(width: u32, height: u32) -> (u32, u32) {
    let height = height.max(width.div_ceil(2));
    (height * 2, height)
}

pub fn geometry_for(stitched: &Path) -> Geometry {
    match image::image_dimensions(stitched) {
        Ok((w, h)) => {
            let (width, height) = equirect_extent(w, h);
            debug!(stage = STAGE, "canvas {w}x{h} -> {width}x{height}");
            Geometry::Exact { width, height }
        }
        Err(err) => {
            warn!(
                stage = STAGE,
                "cannot read {}: {err}; letting ImageMagick size the canvas",
                stitched.display()
            );
            Geometry::Computed
        }
    }
}

pub fn resize_stage(
    stitched: &Path,
    resized: &Path,
    geometry: Geometry,
    quality: u8,
) -> StageDescriptor {
    StageDescriptor {
        name: STAGE,
        tool: ToolKind::ImageMagick,
        args: vec![
            StageArg::path(stitched),
            StageArg::lit("-gravity"),
            StageArg::lit("south"),
            StageArg::lit("-background"),
            StageArg::lit("black"),
            StageArg::lit("-extent"),
            StageArg::Literal(geometry.extent_arg()),
            StageArg::lit("-quality"),
            StageArg::Literal(quality.to_string()),
            StageArg::path(resized),
        ],
        expected_output: resized.to_path_buf(),
        failure_message: "padding the panorama to 2:1 failed",
    }
}

pub fn verify_aspect(path: &Path) -> Result<(u32, u32), StageError> {
    let (width, height) = image::image_dimensions(path).map_err(|err| StageError::Image {
        stage: STAGE,
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    if height == 0 || width != height * 2 {
        return Err(StageError::AspectRatio {
            stage: STAGE,
            path: path.to_path_buf(),
            width,
            height,
        });
    }
    Ok((width, height))
}

pub struct ResizeResult {
    pub resized: PathBuf,
    pub width: u32,
    pub height: u32,
    pub report: StageReport,
}

pub fn run_resize<R: PipelineCommandRunner>(
    executor: &StageExecutor<'_, R>,
    stitched: &Path,
    work_dir: &Path,
    quality: u8,
) -> Result<ResizeResult, StageError> {
    let resized = work_dir.join(RESIZED_FILE);
    // Geometry is only needed when the stage actually runs.
    let placeholder = resize_stage(stitched, resized.as_path(), Geometry::Computed, quality);
    let report = match executor.precondition(&placeholder) {
        StagePrecondition::AlreadySatisfied => skipped_report(&placeholder),
        StagePrecondition::NeedsExecution => {
            let stage = resize_stage(stitched, resized.as_path(), geometry_for(stitched), quality);
            executor.execute(&stage)?
        }
    };
    let (width, height) = verify_aspect(resized.as_path())?;
    Ok(ResizeResult {
        resized,
        width,
        height,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::runtime::CommandSpec;
    use crate::pipeline::stages::test_support::{fake_tools, ok, temp_dir, write_image, FakeRunner};
    use crate::pipeline::stages::StageOutcome;

    /// Plays ImageMagick: writes an image of the requested extent.
    fn magick_runner() -> FakeRunner {
        FakeRunner::new(|spec: &CommandSpec| {
            let extent = spec
                .args
                .iter()
                .position(|a| a == "-extent")
                .and_then(|i| spec.args.get(i + 1))
                .cloned()
                .unwrap_or_default();
            let (w, h) = extent.split_once('x').unwrap_or(("2", "1"));
            let out = spec.args.last().expect("output path is last");
            write_image(
                Path::new(out),
                w.parse().unwrap_or(2),
                h.parse().unwrap_or(1),
            );
            ok()
        })
    }

    #[test]
    fn extent_is_exact_two_to_one() {
        assert_eq!(equirect_extent(4000, 1000), (4000, 2000));
        assert_eq!(equirect_extent(4001, 1000), (4002, 2001));
        assert_eq!(equirect_extent(1000, 900), (1800, 900));
        assert_eq!(equirect_extent(2000, 1000), (2000, 1000));
        for (w, h) in [(1, 1), (7, 3), (9000, 1200), (300, 800)] {
            let (cw, ch) = equirect_extent(w, h);
            assert_eq!(cw, ch * 2);
            assert!(cw >= w && ch >= h);
        }
    }

    #[test]
    fn command_anchors_image_at_the_bottom() {
        let stage = resize_stage(
            Path::new("/w/stitched.tif"),
            Path::new("/w/resized.jpg"),
            Geometry::Exact {
                width: 200,
                height: 100,
            },
            95,
        );
        let args: Vec<_> = stage
            .args
            .iter()
            .map(|a| match a {
                StageArg::Literal(v) => v.clone(),
                StageArg::Path(p) => p.to_string_lossy().to_string(),
                StageArg::Matching { .. } => String::from("?"),
            })
            .collect();
        assert_eq!(
            args.join(" "),
            "/w/stitched.tif -gravity south -background black -extent 200x100 -quality 95 /w/resized.jpg"
        );
    }

    #[test]
    fn unreadable_header_falls_back_to_fx_geometry() {
        let work = temp_dir("resize_fx");
        let bogus = work.join("stitched.tif");
        std::fs::write(bogus.as_path(), b"not a tiff").expect("write");
        assert_eq!(geometry_for(bogus.as_path()), Geometry::Computed);
        assert!(Geometry::Computed.extent_arg().starts_with("%[fx:2*max("));
    }

    #[test]
    fn wide_stitch_is_padded_to_two_to_one() {
        let work = temp_dir("resize_wide");
        let stitched = work.join("stitched.png");
        write_image(stitched.as_path(), 90, 20);
        let tools = fake_tools(Path::new("/usr/bin"));
        let runner = magick_runner();
        let executor = StageExecutor::new(&runner, &tools, work.clone(), false);

        let result =
            run_resize(&executor, stitched.as_path(), work.as_path(), 95).expect("resize works");

        assert_eq!((result.width, result.height), (90, 45));
        assert_eq!(result.report.outcome, StageOutcome::Executed);
        assert!(runner.seen()[0].args.contains(&String::from("90x45")));
    }

    #[test]
    fn wrong_aspect_output_is_rejected() {
        let work = temp_dir("resize_bad");
        let stitched = work.join("stitched.png");
        write_image(stitched.as_path(), 40, 20);
        let tools = fake_tools(Path::new("/usr/bin"));
        let runner = FakeRunner::new(|spec| {
            let out = spec.args.last().expect("output path is last");
            write_image(Path::new(out), 30, 20);
            ok()
        });
        let executor = StageExecutor::new(&runner, &tools, work.clone(), false);

        let err = run_resize(&executor, stitched.as_path(), work.as_path(), 95)
            .err()
            .expect("3:2 output must fail");
        assert!(matches!(
            err,
            StageError::AspectRatio {
                width: 30,
                height: 20,
                ..
            }
        ));
    }

    #[test]
    fn debug_skip_reuses_existing_resized_image() {
        let work = temp_dir("resize_skip");
        write_image(work.join(RESIZED_FILE).as_path(), 64, 32);
        let tools = fake_tools(Path::new("/usr/bin"));
        let runner = magick_runner();
        let executor = StageExecutor::new(&runner, &tools, work.clone(), true);

        let result = run_resize(
            &executor,
            work.join("stitched.tif").as_path(),
            work.as_path(),
            95,
        )
        .expect("skip should verify the existing file");
        assert_eq!(result.report.outcome, StageOutcome::Skipped);
        assert!(runner.seen().is_empty());
    }
}
