//! Grid topology construction shared by both models.
//!
//! Each model only chooses how a lane is discretised: the cell-based model strings
//! `distance` unit cells together, the car-following model uses a long source cell and a
//! zero-length end cell.

use super::{NONE, TARGETS, TERMINATOR};
use crate::GenerationParams;
use cgmath::{Point2, Vector2};
use itertools::iproduct;

/// How a lane is broken up into cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LaneShape {
    /// `distance` chained unit cells.
    Chained,
    /// A cell of length `distance` followed by a zero-length cell.
    Endpoints,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LaneKind {
    /// Connects two junctions.
    Junction,
    /// Leads out of the network.
    Terminator,
    /// Feeds a junction from outside the network.
    Generator,
}

/// UI offsets of lanes towards neighbours, in `T1..T5` order.
const LANE_OFFSETS: [Vector2<i32>; TARGETS] = [
    Vector2 { x: 0, y: -1 },
    Vector2 { x: 1, y: 0 },
    Vector2 { x: 0, y: 1 },
    Vector2 { x: -1, y: 0 },
    Vector2 { x: 0, y: 0 },
];

/// Directions of boundary lanes, in `T1..T5` order.
const BOUNDARY_OFFSETS: [Vector2<i32>; TARGETS] = [
    Vector2 { x: -1, y: 0 },
    Vector2 { x: 0, y: -1 },
    Vector2 { x: 1, y: 0 },
    Vector2 { x: 0, y: 1 },
    Vector2 { x: 0, y: 0 },
];

impl LaneShape {
    /// The positions along the lane direction of each of the lane's cells.
    fn progress(self, kind: LaneKind, distance: i32) -> Vec<i32> {
        match (self, kind) {
            (LaneShape::Chained, LaneKind::Junction) => (0..distance).collect(),
            (LaneShape::Chained, LaneKind::Terminator) => (1..=distance).collect(),
            (LaneShape::Chained, LaneKind::Generator) => (1..=distance).rev().collect(),
            (LaneShape::Endpoints, LaneKind::Generator) => vec![distance, 0],
            (LaneShape::Endpoints, _) => vec![0, distance],
        }
    }

    fn length(self, slot: usize, distance: i32) -> f32 {
        match self {
            LaneShape::Endpoints if slot == 0 => distance as f32,
            _ => 0.0,
        }
    }
}

/// A cell before model-specific state is attached.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CellTemplate {
    pub targets: [i32; TARGETS],
    pub junction_index: i32,
    pub nearest_junction_index: i32,
    pub length: f32,
    pub ui: Point2<i32>,
}

/// The generated road graph.
#[derive(Clone, Debug)]
pub(crate) struct Topology {
    pub cells: Vec<CellTemplate>,
    /// Cell index of every junction.
    pub junctions: Vec<i32>,
    /// Cell index of every generator.
    pub generators: Vec<i32>,
}

struct Builder {
    shape: LaneShape,
    distance: i32,
    cells: Vec<CellTemplate>,
}

impl Builder {
    /// Appends a lane and returns the index of its first cell.
    fn lane(
        &mut self,
        kind: LaneKind,
        origin: Point2<i32>,
        step: Vector2<i32>,
        nearest: i32,
        exit: i32,
    ) -> i32 {
        let first = self.cells.len() as i32;
        let progress = self.shape.progress(kind, self.distance);
        let count = progress.len();
        for (slot, p) in progress.into_iter().enumerate() {
            let last = slot + 1 == count;
            let mut targets = [NONE; TARGETS];
            targets[0] = if last { exit } else { first + slot as i32 + 1 };
            self.cells.push(CellTemplate {
                targets,
                junction_index: if last && kind == LaneKind::Terminator {
                    TERMINATOR
                } else {
                    NONE
                },
                nearest_junction_index: nearest,
                length: self.shape.length(slot, self.distance),
                ui: origin + step * p,
            });
        }
        first
    }
}

/// Builds the junction grid with its lanes, generators and terminators.
pub(crate) fn build(params: &GenerationParams, shape: LaneShape) -> Topology {
    let distance = params.distance;
    let (jx, jy) = (params.junctions_x, params.junctions_y);
    let mut builder = Builder {
        shape,
        distance,
        cells: Vec::new(),
    };

    // Junction cells come first, so junction and cell indices coincide.
    for (y, x) in iproduct!(0..jy, 0..jx) {
        let i = x + y * jx;
        let mut targets = [NONE; TARGETS];
        if x > 0 {
            targets[0] = i - 1;
            builder.cells[(i - 1) as usize].targets[2] = i;
        }
        if y > 0 {
            targets[1] = i - jx;
            builder.cells[(i - jx) as usize].targets[3] = i;
        }
        builder.cells.push(CellTemplate {
            targets,
            junction_index: i,
            nearest_junction_index: NONE,
            length: 0.0,
            ui: Point2::new(x * distance, y * distance),
        });
    }
    let junctions = (0..jx * jy).collect::<Vec<i32>>();

    for &junction in &junctions {
        for (dir, offset) in LANE_OFFSETS.into_iter().enumerate() {
            let target = builder.cells[junction as usize].targets[dir];
            if target == NONE {
                continue;
            }
            let from = builder.cells[junction as usize].ui;
            let to = builder.cells[target as usize].ui;
            let nearest = builder.cells[target as usize].junction_index;
            let first = builder.lane(
                LaneKind::Junction,
                from + offset,
                (to - from) / distance,
                nearest,
                target,
            );
            builder.cells[junction as usize].targets[dir] = first;
        }
    }

    let mut generators = Vec::new();
    for &junction in &junctions {
        for (dir, offset) in BOUNDARY_OFFSETS.into_iter().enumerate() {
            if builder.cells[junction as usize].targets[dir] != NONE {
                continue;
            }
            let from = builder.cells[junction as usize].ui;
            let out_side = Vector2::new(
                if offset.x == 0 { if offset.y < 0 { 1 } else { -1 } } else { 0 },
                if offset.y == 0 { if offset.x > 0 { 1 } else { -1 } } else { 0 },
            );
            let in_side = Vector2::new(
                if offset.x == 0 { if offset.y > 0 { 1 } else { -1 } } else { 0 },
                if offset.y == 0 { if offset.x < 0 { 1 } else { -1 } } else { 0 },
            );
            let terminator =
                builder.lane(LaneKind::Terminator, from + out_side, offset, NONE, NONE);
            builder.cells[junction as usize].targets[dir] = terminator;
            let generator =
                builder.lane(LaneKind::Generator, from + in_side, offset, junction, junction);
            generators.push(generator);
        }
    }

    Topology {
        cells: builder.cells,
        junctions,
        generators,
    }
}
