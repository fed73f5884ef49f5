use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl PidGains {
    pub const fn new(kp: f32, ki: f32, kd: f32) -> Self {
        Self { kp, ki, kd }
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.kp, self.ki, self.kd]
    }

    pub fn from_slice(values: &[f32]) -> Option<Self> {
        match values {
            [kp, ki, kd] => Some(Self::new(*kp, *ki, *kd)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Pid {
    gains: PidGains,
    integral: f32,
    previous_error: f32,
}

impl Pid {
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            integral: 0.0,
            previous_error: 0.0,
        }
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
    }

    pub fn update(&mut self, error: f32, dt: f32) -> f32 {
        let derivative = if dt > 0.0 {
            self.integral += error * dt;
            (error - self.previous_error) / dt
        } else {
            0.0
        };
        self.previous_error = error;
        self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PidConfig {
    /// Inner loop: pendulum angle (rad) to normalized cart force.
    pub angle_gains: PidGains,
    /// Outer loop: cart position error (m) to target angle (rad).
    pub position_gains: PidGains,
    pub min_angle: f32,
    pub max_angle: f32,
    pub target_position: f32,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            angle_gains: PidGains::new(2.6, 0.05, 0.35),
            position_gains: PidGains::new(0.06, 0.0, 0.09),
            min_angle: -0.1,
            max_angle: 0.1,
            target_position: 0.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CascadedPid {
    angle: Pid,
    position: Pid,
    min_angle: f32,
    max_angle: f32,
    target_position: f32,
    target_angle: f32,
}

impl CascadedPid {
    pub fn new(config: &PidConfig) -> Self {
        Self {
            angle: Pid::new(config.angle_gains),
            position: Pid::new(config.position_gains),
            min_angle: config.min_angle.min(config.max_angle),
            max_angle: config.max_angle.max(config.min_angle),
            target_position: config.target_position,
            target_angle: 0.0,
        }
    }

    pub fn angle_loop(&self) -> &Pid {
        &self.angle
    }

    pub fn position_loop(&self) -> &Pid {
        &self.position
    }

    pub fn set_gains(&mut self, angle: PidGains, position: PidGains) {
        self.angle.set_gains(angle);
        self.position.set_gains(position);
    }

    pub fn target_position(&self) -> f32 {
        self.target_position
    }

    pub fn set_target_position(&mut self, target: f32) {
        self.target_position = target;
    }

    pub fn target_angle(&self) -> f32 {
        self.target_angle
    }

    /// Returns a normalized force command in `[-1, 1]`.
    pub fn update(&mut self, cart_position: f32, angle: f32, dt: f32) -> f32 {
        let position_error = self.target_position - cart_position;
        self.target_angle = self
            .position
            .update(position_error, dt)
            .clamp(self.min_angle, self.max_angle);
        let angle_error = angle - self.target_angle;
        self.angle.update(angle_error, dt).clamp(-1.0, 1.0)
    }
}
