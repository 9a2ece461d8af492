/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

pub mod audio;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod events;
pub mod gateway;
pub mod model;
#[cfg(feature = "persistence")]
pub mod store;
pub mod telemetry;
pub mod time;
pub mod tools;
pub mod transport;
pub mod utils;
pub mod voice;
