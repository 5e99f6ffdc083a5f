//! Integer point-in-polygon test used for boundary membership.

/// Pixel coordinate in frame space.
pub type Point = [i32; 2];

/// Boundary-inclusive membership test: points on an edge or vertex count as
/// inside. Polygons with fewer than three vertices contain nothing.
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let (px, py) = (point[0] as i128, point[1] as i128);
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (ax, ay) = (polygon[i][0] as i128, polygon[i][1] as i128);
        let (bx, by) = (polygon[j][0] as i128, polygon[j][1] as i128);

        if on_segment((px, py), (ax, ay), (bx, by)) {
            return true;
        }

        if (ay > py) != (by > py) {
            // Crossing x of the edge at height py compared without division.
            let lhs = (px - ax) * (by - ay);
            let rhs = (py - ay) * (bx - ax);
            let left_of_edge = if by > ay { lhs < rhs } else { lhs > rhs };
            if left_of_edge {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(p: (i128, i128), a: (i128, i128), b: (i128, i128)) -> bool {
    let cross = (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0);
    cross == 0
        && p.0 >= a.0.min(b.0)
        && p.0 <= a.0.max(b.0)
        && p.1 >= a.1.min(b.1)
        && p.1 <= a.1.max(b.1)
}
